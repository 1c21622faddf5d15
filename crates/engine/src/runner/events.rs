use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use contracts::ModuleState;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info_span, warn, Instrument};

use super::{panic_message, Member, RunnerHandle};
use crate::platform::ThreadTuning;
use crate::OptionalWaitCondition;

/// Placement request of one event-driven module
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EventSlot {
    pub name: String,
    /// Sharing key; None asks for a dedicated runner
    pub shared_key: Option<String>,
}

/// Group event-driven modules into runners.
///
/// Dedicated slots get a runner each; shared slots with the same key fill
/// runners of at most `max_per_runner` modules. Registration order is kept.
pub(crate) fn plan_event_runners<T>(
    items: Vec<(EventSlot, T)>,
    max_per_runner: usize,
) -> Vec<(String, Vec<T>)> {
    let max_per_runner = max_per_runner.max(1);
    let mut runners: Vec<(String, Option<String>, Vec<T>)> = Vec::new();

    for (slot, item) in items {
        let Some(key) = slot.shared_key else {
            runners.push((format!("ev-{}", slot.name), None, vec![item]));
            continue;
        };
        let open = runners
            .iter_mut()
            .rev()
            .find(|(_, k, members)| k.as_deref() == Some(key.as_str()) && members.len() < max_per_runner);
        match open {
            Some((_, _, members)) => members.push(item),
            None => {
                let index = runners
                    .iter()
                    .filter(|(_, k, _)| k.as_deref() == Some(key.as_str()))
                    .count();
                let label = if index == 0 {
                    format!("ev-{key}")
                } else {
                    format!("ev-{key}-{index}")
                };
                runners.push((label, Some(key), vec![item]));
            }
        }
    }

    runners
        .into_iter()
        .map(|(label, _, members)| (label, members))
        .collect()
}

/// Spawn one event runner thread hosting `members`
pub(crate) fn spawn_event_runner(
    label: String,
    members: Vec<Member>,
    barrier: Arc<OptionalWaitCondition>,
    tuning: Arc<dyn ThreadTuning>,
    niceness: Option<i32>,
) -> std::io::Result<RunnerHandle> {
    let names: Vec<String> = members.iter().map(|m| m.ctx.name().to_string()).collect();
    let thread_label = label.clone();

    let handle = std::thread::Builder::new().name(label.clone()).spawn(move || {
        let _span = info_span!("event_runner", runner = %thread_label).entered();

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                for member in &members {
                    member.ctx.raise_error(format!("event loop could not be created: {e}"));
                }
                return;
            }
        };

        if let Some(niceness) = niceness {
            if let Err(e) = tuning.set_current_thread_niceness(niceness) {
                warn!(niceness, error = %e, "failed to set event runner niceness");
            }
        }

        for member in &members {
            member.ctx.set_state(ModuleState::Ready);
        }

        runtime.block_on(async move {
            barrier.wait_async().await;
            let tasks: Vec<_> = members
                .into_iter()
                .map(|member| {
                    let span = info_span!("module", module = %member.ctx.name());
                    tokio::spawn(drive(member).instrument(span))
                })
                .collect();
            for task in tasks {
                if let Err(e) = task.await {
                    error!(error = %e, "event task failed");
                }
            }
        });

        if niceness.is_some() {
            if let Err(e) = tuning.reset_current_thread() {
                warn!(error = %e, "failed to reset event runner tuning");
            }
        }
        debug!("event runner finished");
    })?;

    Ok(RunnerHandle::new(label, names, handle))
}

/// Poll one module until it is asked to stop or fails
async fn drive(member: Member) {
    let Member { module, ctx } = member;
    let mut tick = interval(module.event_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while ctx.is_running() {
        tick.tick().await;
        if !ctx.is_running() {
            break;
        }
        match catch_unwind(AssertUnwindSafe(|| module.process_events(&ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                ctx.raise_error(e.to_string());
                break;
            }
            Err(payload) => {
                ctx.raise_error(format!("panicked: {}", panic_message(payload.as_ref())));
                break;
            }
        }
    }
}
