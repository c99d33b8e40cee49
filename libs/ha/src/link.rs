//! The peer link: length-prefixed JSON frames over TCP, optionally
//! TLS-wrapped. The 4-byte big-endian length header comes from
//! `LengthDelimitedCodec`; the payloads are the frames below.
use std::net::Ipv4Addr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use dynconfig::{NodeRole, Section};
use haven_core::prelude::*;

use crate::HaState;

/// Everything that travels between the two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerFrame {
    /// first frame in each direction; carries the shared secret
    Hello {
        node: String,
        role: NodeRole,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        last_seq: u64,
        epoch: u64,
    },
    Heartbeat {
        state: HaState,
        epoch: u64,
        last_seq: u64,
    },
    LeaseUpdate {
        seq: u64,
        lease: Lease,
    },
    LeaseDelete {
        seq: u64,
        ip: Ipv4Addr,
    },
    ConfigSection {
        section: Section,
        data: String,
    },
    SnapshotRequest {
        last_seq: u64,
    },
    SnapshotChunk {
        leases: Vec<Lease>,
    },
    SnapshotEnd {
        last_seq: u64,
    },
}

impl PeerFrame {
    pub fn label(&self) -> &'static str {
        match self {
            PeerFrame::Hello { .. } => "hello",
            PeerFrame::Heartbeat { .. } => "heartbeat",
            PeerFrame::LeaseUpdate { .. } => "lease_update",
            PeerFrame::LeaseDelete { .. } => "lease_delete",
            PeerFrame::ConfigSection { .. } => "config_section",
            PeerFrame::SnapshotRequest { .. } => "snapshot_request",
            PeerFrame::SnapshotChunk { .. } => "snapshot_chunk",
            PeerFrame::SnapshotEnd { .. } => "snapshot_end",
        }
    }
}

/// Object-safe alias over anything the link can run on: plain TCP, a
/// TLS stream, or an in-memory duplex in tests.
pub trait PeerIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerIo for T {}

/// A framed peer connection.
pub struct PeerLink {
    framed: Framed<Box<dyn PeerIo>, LengthDelimitedCodec>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink").finish()
    }
}

impl PeerLink {
    pub fn new(io: Box<dyn PeerIo>) -> Self {
        Self {
            framed: Framed::new(io, LengthDelimitedCodec::new()),
        }
    }

    pub async fn send(&mut self, frame: &PeerFrame) -> Result<()> {
        let bytes = serde_json::to_vec(frame)
            .map_err(|e| Error::PeerUnavailable(format!("encoding frame: {e}")))?;
        self.framed
            .send(Bytes::from(bytes))
            .await
            .map_err(|e| Error::PeerUnavailable(format!("sending frame: {e}")))?;
        metrics::HA_FRAMES_SENT.inc();
        Ok(())
    }

    /// Next frame, `None` on orderly close.
    pub async fn recv(&mut self) -> Result<Option<PeerFrame>> {
        match self.framed.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(Error::PeerUnavailable(format!("reading frame: {e}"))),
            Some(Ok(buf)) => {
                metrics::HA_FRAMES_RECEIVED.inc();
                let frame = serde_json::from_slice(&buf)
                    .map_err(|e| Error::PeerUnavailable(format!("malformed frame: {e}")))?;
                Ok(Some(frame))
            }
        }
    }

    /// Split into independent read and write halves.
    pub fn split(self) -> (PeerSink, PeerSource) {
        let (sink, source) = self.framed.split();
        (PeerSink { sink }, PeerSource { source })
    }
}

type FramedSink = futures::stream::SplitSink<Framed<Box<dyn PeerIo>, LengthDelimitedCodec>, Bytes>;
type FramedSource = futures::stream::SplitStream<Framed<Box<dyn PeerIo>, LengthDelimitedCodec>>;

/// Write half of a split link.
pub struct PeerSink {
    sink: FramedSink,
}

impl PeerSink {
    pub async fn send(&mut self, frame: &PeerFrame) -> Result<()> {
        let bytes = serde_json::to_vec(frame)
            .map_err(|e| Error::PeerUnavailable(format!("encoding frame: {e}")))?;
        self.sink
            .send(Bytes::from(bytes))
            .await
            .map_err(|e| Error::PeerUnavailable(format!("sending frame: {e}")))?;
        metrics::HA_FRAMES_SENT.inc();
        Ok(())
    }
}

/// Read half of a split link.
pub struct PeerSource {
    source: FramedSource,
}

impl PeerSource {
    pub async fn recv(&mut self) -> Result<Option<PeerFrame>> {
        match self.source.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(Error::PeerUnavailable(format!("reading frame: {e}"))),
            Some(Ok(buf)) => {
                metrics::HA_FRAMES_RECEIVED.inc();
                let frame = serde_json::from_slice(&buf)
                    .map_err(|e| Error::PeerUnavailable(format!("malformed frame: {e}")))?;
                Ok(Some(frame))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn lease() -> Lease {
        Lease {
            ip: Ipv4Addr::new(192, 168, 1, 100),
            mac: "00:11:22:33:44:55".parse().unwrap(),
            client_id: Some(vec![1, 2, 3]),
            hostname: Some("printer".into()),
            fqdn: None,
            subnet: "192.168.1.0/24".parse().unwrap(),
            pool: Some("main".into()),
            state: LeaseState::Active,
            starts_at: Utc::now(),
            expires_at: Utc::now(),
            updated_at: Utc::now(),
            update_seq: 42,
            options: BTreeMap::new(),
            relay: RelayInfo::default(),
        }
    }

    #[tokio::test]
    async fn frames_round_trip_over_duplex() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut left = PeerLink::new(Box::new(a));
        let mut right = PeerLink::new(Box::new(b));

        let frames = vec![
            PeerFrame::Hello {
                node: "node-a".into(),
                role: NodeRole::Primary,
                token: Some("secret".into()),
                last_seq: 7,
                epoch: 1,
            },
            PeerFrame::Heartbeat {
                state: HaState::Active,
                epoch: 1,
                last_seq: 7,
            },
            PeerFrame::LeaseUpdate {
                seq: 42,
                lease: lease(),
            },
            PeerFrame::LeaseDelete {
                seq: 43,
                ip: Ipv4Addr::new(192, 168, 1, 100),
            },
            PeerFrame::SnapshotRequest { last_seq: 0 },
            PeerFrame::SnapshotChunk {
                leases: vec![lease()],
            },
            PeerFrame::SnapshotEnd { last_seq: 43 },
        ];
        for frame in &frames {
            left.send(frame).await.unwrap();
        }
        for frame in &frames {
            let got = right.recv().await.unwrap().unwrap();
            assert_eq!(got.label(), frame.label());
        }
    }

    #[test]
    fn frame_wire_tags_are_stable() {
        let json = serde_json::to_string(&PeerFrame::SnapshotRequest { last_seq: 5 }).unwrap();
        assert!(json.contains("\"type\":\"snapshot_request\""));
        let json = serde_json::to_string(&PeerFrame::Heartbeat {
            state: HaState::Standby,
            epoch: 2,
            last_seq: 9,
        })
        .unwrap();
        assert!(json.contains("\"type\":\"heartbeat\""));
        assert!(json.contains("\"state\":\"standby\""));
    }
}
