//! Riemann TCP sink
//!
//! Each batch is one protobuf `Msg` framed by a 4-byte big-endian length.
//! The server answers every message with a `Msg` carrying `ok`.

use super::{Sink, SinkError};
use crate::models::NormalizedRecord;
use crate::proto::riemann::{Attribute, Event, Msg};
use async_trait::async_trait;
use prost::Message;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Replies larger than this are treated as garbage
const MAX_REPLY_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct RiemannSinkConfig {
    pub host: String,
    pub port: u16,
    /// Reported as the `host` of every event
    pub hostname: String,
    /// Bound on connecting and on each send/reply exchange
    pub timeout: Duration,
}

impl Default for RiemannSinkConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5555,
            hostname: String::new(),
            timeout: Duration::from_secs(5),
        }
    }
}

pub struct RiemannSink {
    config: RiemannSinkConfig,
    stream: Option<TcpStream>,
}

impl RiemannSink {
    pub fn new(config: RiemannSinkConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }

    /// Translate records into one Riemann message
    pub fn encode(&self, records: &[NormalizedRecord]) -> Msg {
        let events = records
            .iter()
            .map(|record| Event {
                time: Some(record.time),
                state: Some(record.state.clone()),
                service: Some(record.service.clone()),
                host: Some(self.config.hostname.clone()),
                description: None,
                tags: record.tags.clone(),
                ttl: Some(record.ttl as f32),
                attributes: record
                    .attributes
                    .iter()
                    .map(|(key, value)| Attribute {
                        key: key.clone(),
                        value: Some(value.clone()),
                    })
                    .collect(),
                metric_sint64: record.metric,
            })
            .collect();
        Msg {
            ok: None,
            error: None,
            events,
        }
    }

    async fn with_timeout<T, F>(&self, fut: F) -> Result<T, SinkError>
    where
        F: Future<Output = Result<T, SinkError>>,
    {
        tokio::time::timeout(self.config.timeout, fut)
            .await
            .map_err(|_| SinkError::Timeout(self.config.timeout))?
    }

    async fn send(&mut self, msg: &Msg) -> Result<(), SinkError> {
        if self.stream.is_none() {
            let addr = (self.config.host.clone(), self.config.port);
            let stream = self
                .with_timeout(async { TcpStream::connect(addr).await.map_err(SinkError::from) })
                .await?;
            debug!(host = %self.config.host, port = self.config.port, "Connected to Riemann");
            self.stream = Some(stream);
        }
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };

        let body = msg.encode_to_vec();
        let reply = self.with_timeout(exchange(&mut stream, &body)).await?;

        if reply.ok == Some(false) {
            return Err(SinkError::Rejected(reply.error.unwrap_or_default()));
        }
        // Keep the connection only after a clean exchange
        self.stream = Some(stream);
        Ok(())
    }
}

async fn exchange(stream: &mut TcpStream, body: &[u8]) -> Result<Msg, SinkError> {
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    stream.write_all(&frame).await?;

    let len = stream.read_u32().await? as usize;
    if len > MAX_REPLY_LEN {
        return Err(SinkError::Rejected(format!("reply of {len} bytes")));
    }
    let mut reply = vec![0u8; len];
    stream.read_exact(&mut reply).await?;
    Ok(Msg::decode(reply.as_slice())?)
}

#[async_trait]
impl Sink for RiemannSink {
    async fn emit(&mut self, records: &[NormalizedRecord]) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }
        let msg = self.encode(records);
        self.send(&msg).await
    }

    fn name(&self) -> &'static str {
        "riemann"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordKind;
    use std::collections::BTreeMap;
    use tokio::net::TcpListener;

    fn stat(metric: i64) -> NormalizedRecord {
        NormalizedRecord {
            time: 1442981636,
            kind: RecordKind::Stat,
            state: "ok".to_string(),
            service: "container foo memory usage".to_string(),
            tags: vec!["docker".to_string()],
            ttl: 60,
            attributes: BTreeMap::from([("container".to_string(), "foo".to_string())]),
            metric: Some(metric),
        }
    }

    /// Accept one connection and answer each message with `ok`.
    async fn fake_riemann(ok: bool) -> (u16, tokio::task::JoinHandle<Vec<Msg>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            while let Ok(len) = stream.read_u32().await {
                let mut body = vec![0u8; len as usize];
                stream.read_exact(&mut body).await.unwrap();
                received.push(Msg::decode(body.as_slice()).unwrap());

                let reply = Msg {
                    ok: Some(ok),
                    error: (!ok).then(|| "bad event".to_string()),
                    events: Vec::new(),
                }
                .encode_to_vec();
                stream.write_u32(reply.len() as u32).await.unwrap();
                stream.write_all(&reply).await.unwrap();
                if !ok {
                    break;
                }
            }
            received
        });
        (port, handle)
    }

    fn sink(port: u16) -> RiemannSink {
        RiemannSink::new(RiemannSinkConfig {
            host: "127.0.0.1".to_string(),
            port,
            hostname: "node-1".to_string(),
            timeout: Duration::from_secs(2),
        })
    }

    #[test]
    fn test_encode_maps_every_field() {
        let msg = sink(0).encode(&[stat(134217728)]);
        let event = &msg.events[0];
        assert_eq!(event.time, Some(1442981636));
        assert_eq!(event.host.as_deref(), Some("node-1"));
        assert_eq!(event.service.as_deref(), Some("container foo memory usage"));
        assert_eq!(event.ttl, Some(60.0));
        assert_eq!(event.tags, vec!["docker".to_string()]);
        assert_eq!(event.metric_sint64, Some(134217728));
        assert_eq!(
            event.attributes,
            vec![Attribute {
                key: "container".to_string(),
                value: Some("foo".to_string()),
            }]
        );
    }

    #[tokio::test]
    async fn test_batches_share_one_connection() {
        let (port, server) = fake_riemann(true).await;
        let mut sink = sink(port);

        sink.emit(&[stat(1), stat(2)]).await.unwrap();
        sink.emit(&[stat(3)]).await.unwrap();
        drop(sink);

        let received = server.await.unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].events.len(), 2);
        assert_eq!(received[1].events[0].metric_sint64, Some(3));
    }

    #[tokio::test]
    async fn test_rejection_is_an_error() {
        let (port, server) = fake_riemann(false).await;
        let mut sink = sink(port);

        let err = sink.emit(&[stat(1)]).await.unwrap_err();
        assert!(matches!(err, SinkError::Rejected(ref m) if m == "bad event"));
        assert!(sink.stream.is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut sink = sink(port);
        assert!(sink.emit(&[stat(1)]).await.is_err());
        assert!(sink.emit(&[]).await.is_ok());
    }
}
