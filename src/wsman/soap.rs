//! SOAP chunk reassembly (top of pipeline A).
//!
//! The WinRM provider splits each SOAP document it logs into chunks
//! carried by consecutive events. Chunks of one document share the
//! delivering activity, process and thread; `index` runs from 1 to
//! `totalChunks`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;

use crate::capture::event::{EventHeader, EventSink, Provider, RawEvent};
use crate::error::{EventError, SoapError};
use crate::logging::{component, LogScope};
use crate::pipeline::{guarded, Consumer};

const NO_ACTIVITY: &str = "-1";

/// Identity of one SOAP document transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub activity_id: String,
    pub process_id: u32,
    pub thread_id: u32,
}

impl TransferKey {
    pub fn from_header(header: &EventHeader) -> Self {
        Self {
            activity_id: header
                .activity_id
                .clone()
                .unwrap_or_else(|| NO_ACTIVITY.to_string()),
            process_id: header.process_id,
            thread_id: header.thread_id,
        }
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.activity_id, self.process_id, self.thread_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapChunk {
    pub key: TransferKey,
    pub index: u32,
    pub total: u32,
    pub data: String,
}

impl SoapChunk {
    pub fn from_event(event: &RawEvent) -> Result<Self, EventError> {
        let index = event.uint("index")?;
        let total = event.uint("totalChunks")?;
        let narrow = |field: &'static str, v: u64| {
            u32::try_from(v).map_err(|_| EventError::InvalidField {
                field,
                value: v.to_string(),
            })
        };
        Ok(Self {
            key: TransferKey::from_header(&event.header),
            index: narrow("index", index)?,
            total: narrow("totalChunks", total)?,
            data: event.text("SoapDocument")?.to_string(),
        })
    }

    pub fn is_final(&self) -> bool {
        self.index == self.total
    }
}

/// A complete SOAP document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapMessage {
    pub key: TransferKey,
    pub document: String,
}

#[derive(Debug)]
struct PartialEnvelope {
    next_index: u32,
    buffer: String,
}

pub struct SoapReassembler {
    log: LogScope,
    partial: Mutex<HashMap<TransferKey, PartialEnvelope>>,
    next: Arc<dyn Consumer<SoapMessage>>,
}

impl SoapReassembler {
    pub fn new(log: LogScope, next: Arc<dyn Consumer<SoapMessage>>) -> Self {
        Self {
            log,
            partial: Mutex::new(HashMap::new()),
            next,
        }
    }

    pub fn with_default_log(next: Arc<dyn Consumer<SoapMessage>>) -> Self {
        Self::new(LogScope::component(component::SOAP), next)
    }

    /// Transfers with chunks buffered but not yet complete.
    pub fn pending_count(&self) -> usize {
        self.partial.lock().len()
    }

    fn push(&self, chunk: SoapChunk) -> Result<Option<SoapMessage>, SoapError> {
        log::debug!(
            target: self.log.target(),
            "SOAP_CHUNK key={} index={} total={} len={}",
            chunk.key,
            chunk.index,
            chunk.total,
            chunk.data.len()
        );

        let mut partial = self.partial.lock();
        if chunk.index == 1 {
            if let Some(previous) = partial.remove(&chunk.key) {
                log::warn!(
                    target: self.log.target(),
                    "SOAP_ENVELOPE_RESTARTED key={} abandoned_chunks={}",
                    chunk.key,
                    previous.next_index - 1
                );
            }
        } else {
            let expected = partial.get(&chunk.key).map_or(1, |p| p.next_index);
            if chunk.index != expected {
                partial.remove(&chunk.key);
                return Err(SoapError::OutOfOrderChunk {
                    got: chunk.index,
                    expected,
                });
            }
        }

        let SoapChunk {
            key,
            index,
            total,
            data,
        } = chunk;
        if index >= total {
            let mut document = partial.remove(&key).map(|p| p.buffer).unwrap_or_default();
            document.push_str(&data);
            return Ok(Some(SoapMessage { key, document }));
        }
        let entry = partial.entry(key).or_insert_with(|| PartialEnvelope {
            next_index: 1,
            buffer: String::new(),
        });
        entry.buffer.push_str(&data);
        entry.next_index = index + 1;
        Ok(None)
    }
}

impl Consumer<SoapChunk> for SoapReassembler {
    fn accept(&self, chunk: SoapChunk) {
        let key = chunk.key.clone();
        match self.push(chunk) {
            Ok(Some(message)) => {
                log::info!(
                    target: self.log.target(),
                    "SOAP_ENVELOPE key={} len={}",
                    message.key,
                    message.document.len()
                );
                self.next.accept(message);
            }
            Ok(None) => {}
            Err(e) => {
                log::error!(target: self.log.target(), "SOAP_CHUNK_DROPPED key={} error={}", key, e);
            }
        }
    }
}

impl EventSink for SoapReassembler {
    fn on_event(&self, event: &RawEvent) {
        if event.provider != Provider::WinRm {
            log::debug!(
                target: self.log.target(),
                "FOREIGN_PROVIDER_EVENT provider={}",
                event.provider
            );
            return;
        }
        // Only the chunked SOAP events carry a document.
        if !event.fields.contains_key("SoapDocument") {
            return;
        }
        guarded(&self.log, "SOAP_EVENT", || {
            let chunk = SoapChunk::from_event(event).context("WinRM SOAP chunk event")?;
            self.accept(chunk);
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (Arc<Mutex<Vec<SoapMessage>>>, SoapReassembler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let next = {
            let seen = Arc::clone(&seen);
            crate::pipeline::consumer_fn(move |m: SoapMessage| seen.lock().push(m))
        };
        (seen, SoapReassembler::with_default_log(next))
    }

    fn key(tid: u32) -> TransferKey {
        TransferKey {
            activity_id: "{A}".into(),
            process_id: 10,
            thread_id: tid,
        }
    }

    fn chunk(tid: u32, index: u32, total: u32, data: &str) -> SoapChunk {
        SoapChunk {
            key: key(tid),
            index,
            total,
            data: data.into(),
        }
    }

    #[test]
    fn test_single_chunk_envelope() {
        let (seen, soap) = collector();
        soap.accept(chunk(1, 1, 1, "<s:Envelope/>"));
        assert_eq!(seen.lock()[0].document, "<s:Envelope/>");
        assert_eq!(soap.pending_count(), 0);
    }

    #[test]
    fn test_interleaved_transfers() {
        let (seen, soap) = collector();
        soap.accept(chunk(1, 1, 2, "<a>"));
        soap.accept(chunk(2, 1, 2, "<b>"));
        soap.accept(chunk(2, 2, 2, "</b>"));
        soap.accept(chunk(1, 2, 2, "</a>"));
        let seen = seen.lock();
        assert_eq!(seen[0].document, "<b></b>");
        assert_eq!(seen[0].key, key(2));
        assert_eq!(seen[1].document, "<a></a>");
    }

    #[test]
    fn test_out_of_order_abandons_envelope() {
        let (seen, soap) = collector();
        soap.accept(chunk(1, 1, 3, "<a>"));
        soap.accept(chunk(1, 3, 3, "</a>"));
        assert!(seen.lock().is_empty());
        assert_eq!(soap.pending_count(), 0);

        soap.accept(chunk(1, 2, 2, "</a>"));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_first_chunk_restarts() {
        let (seen, soap) = collector();
        soap.accept(chunk(1, 1, 2, "<lost>"));
        soap.accept(chunk(1, 1, 2, "<a>"));
        soap.accept(chunk(1, 2, 2, "</a>"));
        assert_eq!(seen.lock()[0].document, "<a></a>");
    }

    #[test]
    fn test_chunk_from_event() {
        let event = RawEvent::new(
            Provider::WinRm,
            EventHeader {
                activity_id: None,
                process_id: 4,
                thread_id: 8,
                ..EventHeader::default()
            },
        )
        .with_field("index", 2u64)
        .with_field("totalChunks", 3u64)
        .with_field("SoapDocument", "<x/>");
        let chunk = SoapChunk::from_event(&event).unwrap();
        assert_eq!(chunk.key.to_string(), "-1_4_8");
        assert_eq!(chunk.index, 2);
        assert!(!chunk.is_final());
    }

    #[test]
    fn test_event_sink_filters() {
        let (seen, soap) = collector();
        let other = RawEvent::new(Provider::PowerShell, EventHeader::default()).with_field("SoapDocument", "<x/>");
        soap.on_event(&other);
        let no_doc = RawEvent::new(Provider::WinRm, EventHeader::default()).with_field("index", 1u64);
        soap.on_event(&no_doc);
        let bad = RawEvent::new(Provider::WinRm, EventHeader::default()).with_field("SoapDocument", "<x/>");
        soap.on_event(&bad);
        assert!(seen.lock().is_empty());

        let good = bad.with_field("index", 1u64).with_field("totalChunks", 1u64);
        soap.on_event(&good);
        assert_eq!(seen.lock().len(), 1);
    }
}
