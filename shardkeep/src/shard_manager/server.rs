//! TCP listener exposing the `ShardManager` RPC group (§6 "RPC groups") to
//! remote runners, reusing the Runners wire framing (§4.3.1) rather than a
//! second codec.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

use crate::model::RunnerAddress;
use crate::runners::wire::{self, Frame};

use super::ShardManager;

/// Accept connections forever, handling each on its own task. Returns only
/// if the listener itself fails to accept (caller decides whether to
/// retry or treat it as fatal).
pub async fn serve(manager: Arc<ShardManager>, listener: TcpListener) -> std::io::Error {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => return err,
        };
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(manager, stream).await {
                warn!(%peer, "shard manager connection ended: {err}");
            }
        });
    }
}

async fn handle_connection(manager: Arc<ShardManager>, mut stream: TcpStream) -> Result<(), std::io::Error> {
    loop {
        let frame = match wire::read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(_) => return Ok(()),
        };

        match frame {
            Frame::Register(runner) => {
                let reply = match manager.register(runner).await {
                    Ok(machine_id) => Frame::MachineId(machine_id),
                    Err(err) => Frame::Err(err.to_string()),
                };
                write_or_close(&mut stream, &reply).await?;
            }
            Frame::Unregister(address) => {
                let reply = match manager.unregister(address).await {
                    Ok(()) => Frame::Ack,
                    Err(err) => Frame::Err(err.to_string()),
                };
                write_or_close(&mut stream, &reply).await?;
            }
            Frame::NotifyUnhealthyRunner(address) => {
                let reply = match manager.notify_unhealthy_runner(address).await {
                    Ok(()) => Frame::Ack,
                    Err(err) => Frame::Err(err.to_string()),
                };
                write_or_close(&mut stream, &reply).await?;
            }
            Frame::GetAssignments => {
                let assignments = manager.get_assignments();
                write_or_close(&mut stream, &Frame::Assignments(assignments)).await?;
            }
            Frame::GetTime => {
                write_or_close(&mut stream, &Frame::Time(manager.get_time())).await?;
            }
            Frame::SubscribeEvents => {
                let mut events = manager.sharding_events();
                while let Some(event) = events.recv().await {
                    if wire::write_frame(&mut stream, &Frame::ShardEvent(event)).await.is_err() {
                        break;
                    }
                }
                return Ok(());
            }
            Frame::Ping => {
                write_or_close(&mut stream, &Frame::Pong).await?;
            }
            Frame::Show(verb) => {
                let reply = match crate::admin::execute(&verb, &manager) {
                    Ok(rows) => Frame::ShowReply(rows),
                    Err(message) => Frame::Err(message),
                };
                write_or_close(&mut stream, &reply).await?;
            }
            other => {
                write_or_close(&mut stream, &Frame::Err(format!("unsupported frame {other:?}"))).await?;
            }
        }
    }
}

async fn write_or_close(stream: &mut TcpStream, frame: &Frame) -> Result<(), std::io::Error> {
    wire::write_frame(stream, frame)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer closed"))
}

/// Address this server is bound to, for logging/registration purposes.
pub fn local_address(listener: &TcpListener) -> std::io::Result<RunnerAddress> {
    Ok(listener.local_addr()?.into())
}
