//! Context tracking for the PowerShell provider (pipeline B).
//!
//! The provider reports PSRP fragments directly, with the fragment header
//! already decoded into event fields, but does not say which shell a
//! fragment belongs to. Separate context events tie ActivityIds to shells;
//! fragments are attributed through that map.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;

use crate::capture::event::{EventSink, Provider, RawEvent, PS_CONTEXT_KEYWORD, PS_FRAGMENT_KEYWORD, PS_FRAGMENT_LEVEL};
use crate::logging::{component, LogContext, LogScope};
use crate::pipeline::{guarded, Consumer, Flow, SessionContext};
use crate::psrp::defrag::ContextUpdate;
use crate::psrp::fragment::Fragment;

const SESSION_CREATED: &str = "Creating a server remote session";
const SHELL_CONTEXT: &str = "Shell Context";
const OPERATION_COMPLETE: &str = "Reporting operation complete for request";

#[derive(Debug, Default)]
struct ProviderState {
    shells: HashSet<String>,
    /// ActivityId to ShellId.
    activities: HashMap<String, String>,
}

/// Top stage of pipeline B.
pub struct ProviderContextTracker {
    log: LogScope,
    state: Mutex<ProviderState>,
    next: Arc<dyn Consumer<ContextUpdate>>,
}

impl ProviderContextTracker {
    pub fn new(log: LogScope, next: Arc<dyn Consumer<ContextUpdate>>) -> Self {
        Self {
            log,
            state: Mutex::new(ProviderState::default()),
            next,
        }
    }

    pub fn with_default_log(next: Arc<dyn Consumer<ContextUpdate>>) -> Self {
        Self::new(LogScope::component(component::PROVIDER), next)
    }

    pub fn shell_for_activity(&self, activity_id: &str) -> Option<String> {
        self.state.lock().activities.get(activity_id).cloned()
    }

    pub fn shell_count(&self) -> usize {
        self.state.lock().shells.len()
    }

    fn handle(&self, event: &RawEvent) -> anyhow::Result<()> {
        let header = &event.header;
        if header.keyword == PS_FRAGMENT_KEYWORD {
            // Lower levels of this keyword carry no fragment.
            if header.level == PS_FRAGMENT_LEVEL {
                return self.fragment_event(event);
            }
            return Ok(());
        }
        if header.keyword == PS_CONTEXT_KEYWORD {
            return self.context_event(event);
        }
        Ok(())
    }

    fn fragment_event(&self, event: &RawEvent) -> anyhow::Result<()> {
        let object_id = event.uint("ObjectId").context("PSRP fragment event")?;
        let fragment_id = event.uint("FragmentId").context("PSRP fragment event")?;
        let start = event.flag("sFlag").context("PSRP fragment event")?;
        let end = event.flag("eFlag").context("PSRP fragment event")?;
        let data = event
            .hex_bytes("FragmentPayload")
            .with_context(|| format!("PSRP fragment event object_id={} fragment_id={}", object_id, fragment_id))?;

        if let Ok(declared) = event.uint("FragmentLength") {
            if declared != data.len() as u64 {
                log::warn!(
                    target: self.log.target(),
                    "FRAGMENT_LENGTH_MISMATCH object_id={} fragment_id={} declared={} actual={}",
                    object_id,
                    fragment_id,
                    declared,
                    data.len()
                );
            }
        }

        let state = self.state.lock();
        let shell = event
            .header
            .activity_id
            .as_deref()
            .and_then(|activity| state.activities.get(activity));
        let Some(shell) = shell else {
            log::error!(
                target: self.log.target(),
                "FRAGMENT_WITHOUT_SHELL_CONTEXT activity={:?} pid={} tid={} object_id={} fragment_id={}",
                event.header.activity_id,
                event.header.process_id,
                event.header.thread_id,
                object_id,
                fragment_id
            );
            return Ok(());
        };

        // Forwarded under the lock so a shell cannot close mid-fragment.
        self.next.accept(ContextUpdate::Fragment {
            context: SessionContext::shell(shell, Flow::Unknown),
            fragment: Fragment::new(object_id, fragment_id, start, end, data),
        });
        Ok(())
    }

    fn context_event(&self, event: &RawEvent) -> anyhow::Result<()> {
        let Some(activity) = event.header.activity_id.as_deref() else {
            return Ok(());
        };
        let description = event.description.as_deref().unwrap_or("");
        let mut state = self.state.lock();

        if description.contains(SESSION_CREATED) {
            let shell = param(event, "param1").context("session creation event")?;
            let user = param(event, "param2").unwrap_or_default();
            log::debug!(
                target: self.log.target(),
                "{} SHELL_CREATED activity={} user={}",
                LogContext::for_shell(&shell),
                activity,
                user
            );
            self.track(&mut state, activity, &shell, true);
        } else if description.contains(SHELL_CONTEXT) {
            let shell = param(event, "param1").context("shell context event")?;
            if !state.shells.contains(&shell) {
                log::debug!(
                    target: self.log.target(),
                    "{} SHELL_SEEN_WITHOUT_CREATION activity={}",
                    LogContext::for_shell(&shell),
                    activity
                );
            }
            self.track(&mut state, activity, &shell, false);
        } else if description.contains(OPERATION_COMPLETE) {
            let request = param(event, "param1").context("operation complete event")?;
            if state.shells.remove(&request) {
                state.activities.retain(|_, shell| *shell != request);
                log::debug!(
                    target: self.log.target(),
                    "{} SHELL_CLOSED",
                    LogContext::for_shell(&request)
                );
                self.next.accept(ContextUpdate::CloseShell { shell_id: request });
            }
        }
        Ok(())
    }

    /// Record `activity` as belonging to `shell`. A creation event re-binds
    /// an activity already mapped elsewhere; other events only fill gaps.
    fn track(&self, state: &mut ProviderState, activity: &str, shell: &str, rebind: bool) {
        if state.shells.insert(shell.to_string()) {
            self.next.accept(ContextUpdate::TrackShell {
                shell_id: shell.to_string(),
            });
        }
        match state.activities.get(activity) {
            Some(existing) if existing == shell => {}
            Some(existing) if !rebind => {
                log::debug!(
                    target: self.log.target(),
                    "ACTIVITY_ALREADY_MAPPED activity={} shell={} ignored={}",
                    activity,
                    existing,
                    shell
                );
            }
            existing => {
                if let Some(previous) = existing {
                    log::warn!(
                        target: self.log.target(),
                        "ACTIVITY_REMAPPED activity={} previous={} shell={}",
                        activity,
                        previous,
                        shell
                    );
                }
                state.activities.insert(activity.to_string(), shell.to_string());
            }
        }
    }
}

fn param(event: &RawEvent, name: &'static str) -> anyhow::Result<String> {
    Ok(event.field(name)?.to_string())
}

impl EventSink for ProviderContextTracker {
    fn on_event(&self, event: &RawEvent) {
        if event.provider != Provider::PowerShell {
            log::debug!(
                target: self.log.target(),
                "FOREIGN_PROVIDER_EVENT provider={}",
                event.provider
            );
            return;
        }
        guarded(&self.log, "PROVIDER_EVENT", || self.handle(event));
    }
}
