//! 单条 WebSocket 连接的生命周期
//!
//! 认证 → 注册 → 读写循环 → 注销。写操作统一由发送任务处理，
//! 上行事件在接收任务里逐条顺序处理，不同连接之间互不阻塞。

use std::time::Duration;

use application::{ApplicationError, ConnectionHandle, ServerEvent, VerifyError};
use axum::extract::ws::{CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket};
use axum::body::Bytes;
use domain::Identity;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::protocol::ClientEvent;
use crate::state::AppState;

/// 策略违规关闭码
const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// 单帧写入的最长等待时间，超过即认为对端不再读取
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// 读端结束后等待写端收尾的时间
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    SendPong(Bytes),
    Close,
}

/// 握手阶段认证失败的原因，日志里区分缺失和无效
#[derive(Debug)]
enum HandshakeFailure {
    Missing(&'static str),
    Invalid(String),
    TimedOut,
}

pub struct WebSocketConnection {
    socket: WebSocket,
    state: AppState,
}

impl WebSocketConnection {
    pub fn new(socket: WebSocket, state: AppState) -> Self {
        Self { socket, state }
    }

    /// 运行连接。`identity` 为 `None` 时在超时窗口内等待 `authenticate` 事件。
    pub async fn run(mut self, identity: Option<Identity>) {
        let identity = match identity {
            Some(identity) => identity,
            None => match self.authenticate_in_band().await {
                Ok(identity) => identity,
                Err(failure) => {
                    match &failure {
                        HandshakeFailure::Missing(reason) => {
                            tracing::warn!(reason, "websocket closed: credential missing");
                        }
                        HandshakeFailure::Invalid(reason) => {
                            tracing::warn!(reason = %reason, "websocket closed: credential rejected");
                        }
                        HandshakeFailure::TimedOut => {
                            tracing::warn!(
                                timeout = ?self.state.auth_timeout,
                                "websocket closed: authentication timed out"
                            );
                        }
                    }
                    self.reject().await;
                    return;
                }
            },
        };

        self.serve(identity).await;
    }

    async fn authenticate_in_band(&mut self) -> Result<Identity, HandshakeFailure> {
        let token = tokio::time::timeout(self.state.auth_timeout, self.first_credential())
            .await
            .map_err(|_| HandshakeFailure::TimedOut)??;

        match self.state.verifier.verify(&token).await {
            Ok(identity) => Ok(identity),
            Err(VerifyError::Missing) => Err(HandshakeFailure::Missing("empty token")),
            Err(VerifyError::Invalid(reason)) => Err(HandshakeFailure::Invalid(reason)),
        }
    }

    /// 等待第一条文本帧，它必须是 `authenticate`
    async fn first_credential(&mut self) -> Result<String, HandshakeFailure> {
        while let Some(frame) = self.socket.recv().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    return match serde_json::from_str::<ClientEvent>(text.as_str()) {
                        Ok(ClientEvent::Authenticate { token }) => Ok(token),
                        Ok(_) | Err(_) => Err(HandshakeFailure::Missing(
                            "first event was not authenticate",
                        )),
                    };
                }
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        Err(HandshakeFailure::Missing("socket closed before authenticating"))
    }

    async fn reject(mut self) {
        let error = ServerEvent::from(&ApplicationError::Unauthorized(
            "authentication required".to_string(),
        ));
        if let Some(text) = encode(&error) {
            let _ = self.socket.send(WsMessage::Text(text.into())).await;
        }
        let _ = self
            .socket
            .send(WsMessage::Close(Some(CloseFrame {
                code: CLOSE_POLICY_VIOLATION,
                reason: Utf8Bytes::from_static("unauthorized"),
            })))
            .await;
    }

    async fn serve(self, identity: Identity) {
        let Self { socket, state } = self;
        let chat = state.chat_service.clone();
        let (handle, outbound) = chat.connect(identity.user_id).await;
        let (sender, mut incoming) = socket.split();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<WsCommand>();

        // 发送任务：统一处理所有对 WebSocket sender 的写操作
        let mut send_task = tokio::spawn(write_loop(sender, cmd_rx, outbound, WRITE_TIMEOUT));

        // 接收任务：逐条处理上行事件
        let mut recv_task = {
            let handle = handle.clone();
            tokio::spawn(async move {
                while let Some(frame) = incoming.next().await {
                    match frame {
                        Ok(WsMessage::Text(text)) => {
                            dispatch(&state, &handle, text.as_str()).await;
                        }
                        Ok(WsMessage::Binary(_)) => {
                            handle.deliver(ServerEvent::error(
                                "VALIDATION",
                                "binary frames are not supported",
                            ));
                        }
                        Ok(WsMessage::Ping(data)) => {
                            let _ = cmd_tx.send(WsCommand::SendPong(data));
                        }
                        Ok(WsMessage::Pong(_)) => {}
                        Ok(WsMessage::Close(_)) => {
                            let _ = cmd_tx.send(WsCommand::Close);
                            break;
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, "websocket read failed");
                            break;
                        }
                    }
                }
            })
        };

        // 等待任意一个任务完成（连接断开）
        tokio::select! {
            exit = &mut send_task => {
                recv_task.abort();
                if let Ok(WriterExit::TimedOut) = exit {
                    tracing::warn!(
                        user_id = %handle.user_id(),
                        connection_id = %handle.id(),
                        timeout = ?WRITE_TIMEOUT,
                        "websocket write stalled, closing connection"
                    );
                }
            }
            _ = &mut recv_task => {
                // 读端退出后让写端把排队的关闭帧发完
                if tokio::time::timeout(CLOSE_GRACE, &mut send_task).await.is_err() {
                    send_task.abort();
                }
            }
        }

        chat.disconnect(&handle).await;
    }
}

/// 处理一条上行事件，失败只通知当前连接
async fn dispatch(state: &AppState, handle: &ConnectionHandle, raw: &str) {
    let event = match serde_json::from_str::<ClientEvent>(raw) {
        Ok(event) => event,
        Err(err) => {
            tracing::debug!(connection_id = %handle.id(), error = %err, "malformed client event");
            handle.deliver(ServerEvent::error(
                "VALIDATION",
                format!("malformed event: {err}"),
            ));
            return;
        }
    };

    let chat = &state.chat_service;
    let result = match event {
        ClientEvent::Authenticate { .. } => Err(ApplicationError::validation(
            "connection is already authenticated",
        )),
        ClientEvent::JoinConversation { conversation_id } => chat
            .join_conversation(handle, conversation_id)
            .await
            .map(|_| ()),
        ClientEvent::LeaveConversation { conversation_id } => {
            chat.leave_conversation(handle, conversation_id).await;
            Ok(())
        }
        ClientEvent::SendMessage {
            conversation_id,
            text,
        } => chat
            .send_message(handle, conversation_id, &text)
            .await
            .map(|_| ()),
        ClientEvent::Typing {
            conversation_id,
            is_typing,
        } => chat
            .typing(handle, conversation_id, is_typing)
            .await
            .map(|_| ()),
        ClientEvent::Ping => {
            handle.deliver(ServerEvent::Pong);
            Ok(())
        }
    };

    if let Err(err) = result {
        tracing::debug!(
            user_id = %handle.user_id(),
            connection_id = %handle.id(),
            code = err.code(),
            error = %err,
            "client event failed"
        );
        handle.deliver(ServerEvent::from(&err));
    }
}

/// 写任务退出原因
#[derive(Debug, PartialEq, Eq)]
enum WriterExit {
    /// 已回复关闭帧
    Closed,
    /// 读端已退出，命令通道关闭
    ReaderGone,
    /// 连接已从注册表移除
    QueueClosed,
    SocketError,
    TimedOut,
}

/// 发送循环。命令优先于普通事件，读端退出前排队的命令会被写完。
async fn write_loop<S>(
    mut sink: S,
    mut commands: mpsc::UnboundedReceiver<WsCommand>,
    mut outbound: mpsc::UnboundedReceiver<ServerEvent>,
    write_timeout: Duration,
) -> WriterExit
where
    S: Sink<WsMessage> + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(WsCommand::SendPong(data)) => WsMessage::Pong(data),
                Some(WsCommand::Close) => {
                    return match send_frame(&mut sink, WsMessage::Close(None), write_timeout).await {
                        Ok(()) => WriterExit::Closed,
                        Err(exit) => exit,
                    };
                }
                None => return WriterExit::ReaderGone,
            },
            event = outbound.recv() => {
                let Some(event) = event else {
                    return WriterExit::QueueClosed;
                };
                let Some(text) = encode(&event) else {
                    continue;
                };
                WsMessage::Text(text.into())
            }
        };

        if let Err(exit) = send_frame(&mut sink, frame, write_timeout).await {
            return exit;
        }
    }
}

async fn send_frame<S>(
    sink: &mut S,
    frame: WsMessage,
    write_timeout: Duration,
) -> Result<(), WriterExit>
where
    S: Sink<WsMessage> + Unpin,
{
    match tokio::time::timeout(write_timeout, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => {
            tracing::debug!("websocket send failed, closing writer");
            Err(WriterExit::SocketError)
        }
        Err(_) => Err(WriterExit::TimedOut),
    }
}

fn encode(event: &ServerEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(err) => {
            tracing::warn!(event = event.name(), error = %err, "failed to serialize websocket payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stalled_socket_times_out_writer() {
        // 容量耗尽后对端不再读取
        let (sink, _unread) = futures::channel::mpsc::channel::<WsMessage>(0);
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        for _ in 0..4 {
            out_tx.send(ServerEvent::Pong).unwrap();
        }

        let exit = tokio::time::timeout(
            Duration::from_secs(2),
            write_loop(sink, cmd_rx, out_rx, Duration::from_millis(50)),
        )
        .await
        .expect("writer should give up on a stalled socket");
        assert_eq!(exit, WriterExit::TimedOut);
    }

    #[tokio::test]
    async fn queued_close_is_written_after_reader_exits() {
        let (sink, mut frames) = futures::channel::mpsc::unbounded::<WsMessage>();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (_out_tx, out_rx) = mpsc::unbounded_channel();
        cmd_tx.send(WsCommand::Close).unwrap();
        drop(cmd_tx);

        let exit = write_loop(sink, cmd_rx, out_rx, Duration::from_secs(1)).await;
        assert_eq!(exit, WriterExit::Closed);
        assert!(matches!(frames.next().await, Some(WsMessage::Close(None))));
    }

    #[tokio::test]
    async fn pending_pong_is_flushed_before_writer_stops() {
        let (sink, mut frames) = futures::channel::mpsc::unbounded::<WsMessage>();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (_out_tx, out_rx) = mpsc::unbounded_channel();
        cmd_tx
            .send(WsCommand::SendPong(Bytes::from_static(b"hb")))
            .unwrap();
        drop(cmd_tx);

        let exit = write_loop(sink, cmd_rx, out_rx, Duration::from_secs(1)).await;
        assert_eq!(exit, WriterExit::ReaderGone);
        match frames.next().await {
            Some(WsMessage::Pong(data)) => assert_eq!(&data[..], b"hb"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
