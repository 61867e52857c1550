//! Length-prefixed JSON framing for the `Runners` RPC verbs (§4.3.1). Each
//! frame on the wire is a 4-byte big-endian length followed by that many
//! bytes of JSON, mirroring how the grounding codebase's `net::messages`
//! frames the Postgres wire protocol off a plain `tokio::io` stream.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::model::{Envelope, Reply, Runner, RunnerAddress, ShardId};
use crate::shard_manager::ShardingEvent;

use super::error::Error;

const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// One message on the wire, shared by the two RPC groups described in
/// §6 ("RPC groups"): `Runners` (`Ping`/`Notify`/`Effect`/`Stream`/
/// `EnvelopeMsg`) and `ShardManager` (`Register`/`Unregister`/
/// `NotifyUnhealthyRunner`/`GetAssignments`/`SubscribeEvents`/`GetTime`).
/// One multiplexed frame type keeps the transport binding (§4.3.1) in a
/// single place rather than two near-identical codecs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "frame")]
pub enum Frame {
    Ping,
    Pong,
    Notify(Envelope),
    Effect(Envelope),
    Stream(Envelope),
    /// `AckChunk` or `Interrupt` envelope delivered out-of-band.
    EnvelopeMsg(Envelope),
    Reply(Reply),
    Ack,
    Err(String),

    Register(Runner),
    MachineId(u64),
    Unregister(RunnerAddress),
    NotifyUnhealthyRunner(RunnerAddress),
    GetAssignments,
    Assignments(HashMap<ShardId, Option<RunnerAddress>>),
    SubscribeEvents,
    ShardEvent(ShardingEvent),
    GetTime,
    Time(i64),

    /// An admin introspection verb, e.g. `"SHOW STATS"`.
    Show(String),
    ShowReply(Vec<String>),
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), Error> {
    let body = serde_json::to_vec(frame)?;
    let len = body.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| Error::io("frame write", e))?;
    writer
        .write_all(&body)
        .await
        .map_err(|e| Error::io("frame write", e))?;
    writer.flush().await.map_err(|e| Error::io("frame flush", e))?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, Error> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| Error::io("frame read", e))?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(Error::io(
            "frame read",
            std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::io("frame read", e))?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::duplex;

    fn request() -> Envelope {
        Envelope::Request {
            request_id: 1,
            address: crate::model::EntityAddress {
                shard_id: crate::model::ShardId::new("default", 0),
                entity_type: "Counter".into(),
                entity_id: "abc".into(),
            },
            tag: "Increment".into(),
            payload: serde_json::json!({"key": "k1"}),
            headers: HashMap::new(),
            trace_id: None,
            span_id: None,
            sampled: false,
            deliver_at: None,
        }
    }

    #[tokio::test]
    async fn test_roundtrip_effect_frame() {
        let (mut a, mut b) = duplex(4096);
        let frame = Frame::Effect(request());
        write_frame(&mut a, &frame).await.unwrap();
        let read = read_frame(&mut b).await.unwrap();
        assert_eq!(frame, read);
    }

    #[tokio::test]
    async fn test_roundtrip_ping_pong() {
        let (mut a, mut b) = duplex(4096);
        write_frame(&mut a, &Frame::Ping).await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), Frame::Ping);

        write_frame(&mut b, &Frame::Pong).await.unwrap();
        assert_eq!(read_frame(&mut a).await.unwrap(), Frame::Pong);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = duplex(16);
        a.write_all(&(MAX_FRAME_LEN + 1).to_be_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
