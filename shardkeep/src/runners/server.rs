//! Peer-to-peer TCP listener: accepts `Ping`/`Notify`/`Effect`/`Stream`/
//! `EnvelopeMsg` frames from other runners and routes them into this
//! runner's [`LocalDispatch`], the inbound counterpart to the client calls
//! in this module. Mirrors `shard_manager::server`'s accept-loop shape.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::warn;

use crate::model::Envelope;

use super::wire::{self, Frame};
use super::Runners;

pub async fn serve(runners: Arc<Runners>, listener: TcpListener) -> std::io::Error {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => return err,
        };
        let runners = Arc::clone(&runners);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(&runners, stream).await {
                warn!(%peer, "runner connection ended: {err}");
            }
        });
    }
}

async fn handle_connection(runners: &Arc<Runners>, mut stream: TcpStream) -> std::io::Result<()> {
    loop {
        let frame = match wire::read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(_) => return Ok(()),
        };

        match frame {
            Frame::Ping => write_or_close(&mut stream, &Frame::Pong).await?,
            Frame::Notify(envelope) => {
                let reply = match runners.local().notify_local(envelope).await {
                    Ok(()) => Frame::Ack,
                    Err(err) => Frame::Err(err.to_string()),
                };
                write_or_close(&mut stream, &reply).await?;
            }
            Frame::EnvelopeMsg(envelope) => {
                let reply = match runners.local().envelope_local(envelope).await {
                    Ok(()) => Frame::Ack,
                    Err(err) => Frame::Err(err.to_string()),
                };
                write_or_close(&mut stream, &reply).await?;
            }
            Frame::Effect(envelope) => {
                let reply = match runners.local().dispatch_local(envelope).await {
                    Ok(reply) => Frame::Reply(reply),
                    Err(err) => Frame::Err(err.to_string()),
                };
                write_or_close(&mut stream, &reply).await?;
            }
            Frame::Stream(envelope) => {
                handle_stream(runners, envelope, &mut stream).await?;
            }
            other => {
                write_or_close(&mut stream, &Frame::Err(format!("unsupported frame {other:?}"))).await?;
            }
        }
    }
}

/// Drains every reply the local entity emits (chunks then the terminal
/// `WithExit`) onto the wire, one `Frame::Reply` each.
async fn handle_stream(runners: &Arc<Runners>, envelope: Envelope, stream: &mut TcpStream) -> std::io::Result<()> {
    let (tx, mut rx) = mpsc::channel(32);
    if let Err(err) = runners.local().stream_local(envelope, tx).await {
        return write_or_close(stream, &Frame::Err(err.to_string())).await;
    }

    while let Some(reply) = rx.recv().await {
        let is_exit = reply.is_exit();
        write_or_close(stream, &Frame::Reply(reply)).await?;
        if is_exit {
            break;
        }
    }
    Ok(())
}

async fn write_or_close(stream: &mut TcpStream, frame: &Frame) -> std::io::Result<()> {
    wire::write_frame(stream, frame)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer closed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityAddress, Exit, Reply, ShardId};
    use crate::runners::{Error, LocalDispatch};
    use async_trait::async_trait;
    use tokio::net::TcpListener;

    struct Echo;

    #[async_trait]
    impl LocalDispatch for Echo {
        async fn dispatch_local(&self, envelope: Envelope) -> Result<Reply, Error> {
            Ok(Reply::WithExit {
                id: envelope.request_id(),
                request_id: envelope.request_id(),
                exit: Exit::Success(serde_json::json!("ok")),
            })
        }
        async fn notify_local(&self, _envelope: Envelope) -> Result<(), Error> {
            Ok(())
        }
        async fn envelope_local(&self, _envelope: Envelope) -> Result<(), Error> {
            Ok(())
        }
        async fn stream_local(&self, envelope: Envelope, tx: mpsc::Sender<Reply>) -> Result<(), Error> {
            let _ = tx
                .send(Reply::Chunk {
                    id: 1,
                    request_id: envelope.request_id(),
                    sequence: 0,
                    values: vec![serde_json::json!(1)],
                })
                .await;
            let _ = tx
                .send(Reply::WithExit {
                    id: 2,
                    request_id: envelope.request_id(),
                    exit: Exit::Success(serde_json::json!("done")),
                })
                .await;
            Ok(())
        }
    }

    fn envelope() -> Envelope {
        Envelope::Request {
            request_id: 1,
            address: EntityAddress {
                shard_id: ShardId::new("default", 0),
                entity_type: "Counter".into(),
                entity_id: "abc".into(),
            },
            tag: "Increment".into(),
            payload: serde_json::json!({}),
            headers: Default::default(),
            trace_id: None,
            span_id: None,
            sampled: false,
            deliver_at: None,
        }
    }

    #[tokio::test]
    async fn test_effect_roundtrip_over_tcp() {
        let runners = Runners::new();
        runners.bind_local(Arc::new(Echo));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(runners, listener));

        let mut client = TcpStream::connect(addr).await.unwrap();
        wire::write_frame(&mut client, &Frame::Effect(envelope())).await.unwrap();
        match wire::read_frame(&mut client).await.unwrap() {
            Frame::Reply(Reply::WithExit { exit, .. }) => assert_eq!(exit, Exit::Success(serde_json::json!("ok"))),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_roundtrip_over_tcp() {
        let runners = Runners::new();
        runners.bind_local(Arc::new(Echo));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(runners, listener));

        let mut client = TcpStream::connect(addr).await.unwrap();
        wire::write_frame(&mut client, &Frame::Stream(envelope())).await.unwrap();

        match wire::read_frame(&mut client).await.unwrap() {
            Frame::Reply(Reply::Chunk { .. }) => {}
            other => panic!("expected chunk, got {other:?}"),
        }
        match wire::read_frame(&mut client).await.unwrap() {
            Frame::Reply(Reply::WithExit { .. }) => {}
            other => panic!("expected exit, got {other:?}"),
        }
    }
}
