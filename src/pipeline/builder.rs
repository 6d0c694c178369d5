//! Assembly of the two trace pipelines.
//!
//! ```text
//! WinRM:      SoapReassembler -> ManagementContextTracker -> FragmentReassembler -> MessageParser -> CommandTracer
//! PowerShell: ProviderContextTracker                     -> FragmentReassembler -> MessageParser -> CommandTracer
//! ```

use std::sync::Arc;

use crate::capture::event::{EventSink, Provider, RawEvent};
use crate::capture::powershell::ProviderContextTracker;
use crate::clixml::ShapeAction;
use crate::config::TracerConfig;
use crate::logging::{component, LogScope};
use crate::pipeline::Consumer;
use crate::psrp::{ContextUpdate, DefragStats, FragmentReassembler, Message, MessageParser};
use crate::tracer::{CommandTracer, ConsoleSink, TraceSink};
use crate::wsman::{Decompressor, ManagementContextTracker, SoapReassembler};

/// A complete pipeline, fed through its [`EventSink`] implementation.
pub struct TracePipeline {
    provider: Provider,
    log: LogScope,
    config: TracerConfig,
    entry: Arc<dyn EventSink>,
    defrag: Arc<FragmentReassembler>,
    tracer: Arc<CommandTracer>,
}

impl TracePipeline {
    /// Pipeline decoding WinRM SOAP traffic.
    pub fn winrm(
        config: &TracerConfig,
        sinks: Vec<Arc<dyn TraceSink>>,
        decompressor: Option<Arc<dyn Decompressor>>,
    ) -> Self {
        let (tracer, defrag) = Self::tail(config, sinks);

        let mut wsman = ManagementContextTracker::new(
            scope(config, component::WSMAN),
            Arc::clone(&defrag) as Arc<dyn Consumer<ContextUpdate>>,
        )
        .with_compressed_streams(config.compressed_streams);
        if let Some(decompressor) = decompressor {
            wsman = wsman.with_decompressor(decompressor);
        }
        let soap = SoapReassembler::new(scope(config, component::SOAP), Arc::new(wsman));

        Self::assemble(config, Provider::WinRm, Arc::new(soap), defrag, tracer)
    }

    /// Pipeline decoding the PowerShell provider's fragment events.
    pub fn powershell(config: &TracerConfig, sinks: Vec<Arc<dyn TraceSink>>) -> Self {
        let (tracer, defrag) = Self::tail(config, sinks);
        let provider = ProviderContextTracker::new(
            scope(config, component::PROVIDER),
            Arc::clone(&defrag) as Arc<dyn Consumer<ContextUpdate>>,
        );
        Self::assemble(config, Provider::PowerShell, Arc::new(provider), defrag, tracer)
    }

    fn tail(config: &TracerConfig, mut sinks: Vec<Arc<dyn TraceSink>>) -> (Arc<CommandTracer>, Arc<FragmentReassembler>) {
        if config.interactive {
            sinks.push(Arc::new(ConsoleSink::stdout()));
        }
        let tracer = Arc::new(CommandTracer::new(scope(config, component::TRACER), sinks));
        let parser = MessageParser::new(
            scope(config, component::PARSER),
            Arc::clone(&tracer) as Arc<dyn Consumer<Message>>,
        );
        let defrag = Arc::new(FragmentReassembler::new(
            scope(config, component::DEFRAG),
            Arc::new(parser),
        ));
        (tracer, defrag)
    }

    fn assemble(
        config: &TracerConfig,
        provider: Provider,
        entry: Arc<dyn EventSink>,
        defrag: Arc<FragmentReassembler>,
        tracer: Arc<CommandTracer>,
    ) -> Self {
        Self {
            provider,
            log: scope(config, component::CAPTURE),
            config: config.clone(),
            entry,
            defrag,
            tracer,
        }
    }

    /// The provider this pipeline decodes; the capture session should
    /// enable it with [`Provider::level`] and [`Provider::keywords`].
    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn stats(&self) -> DefragStats {
        self.defrag.stats()
    }

    pub fn tracer(&self) -> &Arc<CommandTracer> {
        &self.tracer
    }

    pub fn register_shape(&self, type_name: &str, action: ShapeAction) {
        self.tracer.register_shape(type_name, action);
    }
}

fn scope(config: &TracerConfig, name: &str) -> LogScope {
    LogScope::new(&config.log.namespace, name)
}

impl EventSink for TracePipeline {
    fn on_event(&self, event: &RawEvent) {
        if self.config.excludes(event.header.process_id) {
            log::trace!(
                target: self.log.target(),
                "EVENT_EXCLUDED pid={}",
                event.header.process_id
            );
            return;
        }
        self.entry.on_event(event);
    }

    fn on_session_start(&self, session: &str) {
        log::info!(
            target: self.log.target(),
            "CAPTURE_SESSION_STARTED session={} provider={}",
            session,
            self.provider
        );
    }

    fn on_session_stop(&self, session: &str) {
        let stats = self.stats();
        log::info!(
            target: self.log.target(),
            "CAPTURE_SESSION_STOPPED session={} provider={} fragments={} messages={} out_of_order={}",
            session,
            self.provider,
            stats.fragments,
            stats.messages,
            stats.out_of_order
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::event::{EventHeader, PS_CONTEXT_KEYWORD, PS_FRAGMENT_KEYWORD};
    use crate::tracer::MemorySink;

    fn quiet() -> TracerConfig {
        TracerConfig {
            interactive: false,
            exclude_process_ids: vec![666],
            ..TracerConfig::default()
        }
    }

    fn event(pid: u32, keyword: u64, level: u8) -> RawEvent {
        RawEvent::new(
            Provider::PowerShell,
            EventHeader {
                activity_id: Some("{ACT}".into()),
                process_id: pid,
                keyword,
                level,
                ..EventHeader::default()
            },
        )
    }

    fn fragment_events(pid: u32) -> Vec<RawEvent> {
        let created = event(pid, PS_CONTEXT_KEYWORD, 4)
            .with_description("Request %1. Creating a server remote session. UserName: %2")
            .with_field("param1", "SHELL")
            .with_field("param2", "user");
        let fragment = event(pid, PS_FRAGMENT_KEYWORD, 5)
            .with_field("ObjectId", 1u64)
            .with_field("FragmentId", 0u64)
            .with_field("sFlag", true)
            .with_field("eFlag", true)
            .with_field("FragmentLength", 3u64)
            .with_field("FragmentPayload", "0x010203");
        vec![created, fragment]
    }

    #[test]
    fn test_powershell_pipeline_counts_fragments() {
        let sink = Arc::new(MemorySink::new());
        let pipeline = TracePipeline::powershell(&quiet(), vec![sink.clone() as Arc<dyn TraceSink>]);
        assert_eq!(pipeline.provider(), Provider::PowerShell);
        for e in fragment_events(100) {
            pipeline.on_event(&e);
        }
        let stats = pipeline.stats();
        assert_eq!(stats.fragments, 1);
        assert_eq!(stats.messages, 1);
        // Three bytes is no valid message, so nothing reaches the sink.
        assert!(sink.is_empty());
    }

    #[test]
    fn test_excluded_process_dropped() {
        let pipeline = TracePipeline::powershell(&quiet(), Vec::new());
        for e in fragment_events(666) {
            pipeline.on_event(&e);
        }
        assert_eq!(pipeline.stats(), DefragStats::default());
    }

    #[test]
    fn test_winrm_pipeline_ignores_foreign_provider() {
        let pipeline = TracePipeline::winrm(&quiet(), Vec::new(), None);
        assert_eq!(pipeline.provider(), Provider::WinRm);
        pipeline.on_session_start("test");
        for e in fragment_events(100) {
            pipeline.on_event(&e);
        }
        pipeline.on_session_stop("test");
        assert_eq!(pipeline.stats().fragments, 0);
    }
}
