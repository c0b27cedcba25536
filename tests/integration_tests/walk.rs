use fallible_iterator::FallibleIterator;
use itertools::Itertools;
use sehunwind::*;

use super::common::*;

#[test]
fn walk_yields_every_frame() {
    let fixture = Fixture::new();
    let handlers = HandlerRegistry::new();
    let runtime = fixture.runtime(&handlers);

    let frames: Vec<u64> = runtime
        .walk_frames(&fixture.fault_context())
        .collect()
        .unwrap();
    assert_eq!(frames, vec![C_FAULT, B_RET, A_RET]);
}

#[test]
fn capture_skips_and_truncates() {
    let fixture = Fixture::new();
    let handlers = HandlerRegistry::new();
    let runtime = fixture.runtime(&handlers);
    let context = fixture.fault_context();

    let full = runtime.capture_back_trace(&context, 0, 16);
    assert_eq!(full.frames, vec![C_FAULT, B_RET, A_RET]);
    assert_eq!(
        full.hash,
        [C_FAULT, B_RET, A_RET]
            .iter()
            .fold(0u32, |hash, &pc| hash.wrapping_add(pc as u32))
    );

    let skipped = runtime.capture_back_trace(&context, 1, 16);
    assert_eq!(skipped.frames, vec![B_RET, A_RET]);
    let truncated = runtime.capture_back_trace(&context, 0, 2);
    assert_eq!(truncated.frames, vec![C_FAULT, B_RET]);

    // Every capture is a window of the full walk.
    for (skip, count) in (0..4).cartesian_product(0..4) {
        let trace = runtime.capture_back_trace(&context, skip, count);
        assert_eq!(
            trace.frames,
            full.frames.iter().copied().skip(skip).take(count).collect_vec()
        );
    }
}

struct Unwalkable(StackLimits);

impl ThreadEnvironment for Unwalkable {
    fn stack_limits(&self) -> StackLimits {
        self.0
    }

    fn can_walk_stack(&self) -> bool {
        false
    }
}

#[test]
fn capture_respects_the_environment() {
    let fixture = Fixture::new();
    let handlers = HandlerRegistry::new();
    let environment = Unwalkable(StackLimits::new(STACK_LOW, STACK_HIGH));
    let runtime = SehRuntime::new(&fixture.directory, &fixture.stack, &handlers, &environment);

    assert_eq!(
        runtime.capture_back_trace(&fixture.fault_context(), 0, 16),
        BackTrace::default()
    );
}

#[test]
fn faulting_walk_captures_nothing() {
    let fixture = Fixture::new();
    let handlers = HandlerRegistry::new();
    let unreadable = |_address: u64| -> Result<u64, ()> { Err(()) };
    let runtime = SehRuntime::new(&fixture.directory, &unreadable, &handlers, &fixture.environment);

    let context = fixture.fault_context();
    let mut walk = runtime.walk_frames(&context);
    assert_eq!(walk.next(), Ok(Some(C_FAULT)));
    assert_eq!(walk.next(), Err(Error::CouldNotReadStack(FRAME_C + 0x20)));
    assert!(runtime.capture_back_trace(&context, 0, 16).is_empty());
}

#[test]
fn looping_stack_is_bounded() {
    let mut fixture = Fixture::without_handlers();
    let context = fixture.make_machine_frame_loop();
    let handlers = HandlerRegistry::new();
    let runtime = fixture.runtime(&handlers).with_config(RuntimeConfig {
        max_walk_frames: 5,
        ..Default::default()
    });

    let trace = runtime.capture_back_trace(&context, 0, 64);
    assert_eq!(trace.frames, vec![D + 0x10; 5]);
}

#[cfg(feature = "trace-database")]
#[test]
fn traces_are_deduplicated() {
    let fixture = Fixture::new();
    let handlers = HandlerRegistry::new();
    let runtime = fixture.runtime(&handlers);
    let database = StackTraceDatabase::new(0x1000, 16);

    let context = fixture.fault_context();
    let first = runtime.log_stack_back_trace(&database, &context, 0);
    assert_ne!(first, 0);
    assert_eq!(runtime.log_stack_back_trace(&database, &context, 0), first);
    let shorter = runtime.log_stack_back_trace(&database, &context, 1);
    assert_ne!(shorter, first);

    let entry = database.trace(first).unwrap();
    assert_eq!(entry.frames(), &[C_FAULT, B_RET, A_RET]);
    assert_eq!(entry.ref_count(), 2);
    assert_eq!(database.trace(shorter).unwrap().depth(), 2);
    assert_eq!(database.len(), 2);
}
