use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use contracts::ModuleState;
use tracing::{debug, info_span};

use super::{panic_message, Member, RunnerHandle};
use crate::platform::{ThreadTuning, TuningPlan};
use crate::OptionalWaitCondition;

/// Spawn the dedicated thread of one module.
///
/// The thread tunes itself, reports Ready and hands control to
/// `run_thread`, which waits on the barrier.
pub(crate) fn spawn_module_thread(
    member: Member,
    barrier: Arc<OptionalWaitCondition>,
    tuning: Arc<dyn ThreadTuning>,
    plan: TuningPlan,
) -> std::io::Result<RunnerHandle> {
    let name = member.ctx.name().to_string();
    let label = format!("mod-{name}");

    let handle = std::thread::Builder::new().name(label.clone()).spawn(move || {
        let Member { module, ctx } = member;
        let _span = info_span!("module", module = %ctx.name()).entered();

        plan.apply(tuning.as_ref(), ctx.name());
        ctx.set_state(ModuleState::Ready);

        let result = catch_unwind(AssertUnwindSafe(|| module.run_thread(&ctx, &barrier)));
        match result {
            Ok(Ok(())) => debug!("module thread finished"),
            Ok(Err(e)) => ctx.raise_error(e.to_string()),
            Err(payload) => ctx.raise_error(format!("panicked: {}", panic_message(payload.as_ref()))),
        }

        plan.reset(tuning.as_ref(), ctx.name());
    })?;

    Ok(RunnerHandle::new(label, vec![name], handle))
}
