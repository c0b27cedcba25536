use std::cell::{Cell, RefCell};
use std::rc::Rc;

use itertools::Itertools;
use sehunwind::x86_64::Amd64EpilogueDecoder;
use sehunwind::*;

use super::common::*;

type Calls = Rc<RefCell<Vec<(u64, ExceptionFlags)>>>;

/// Registers handlers for `A`, `B` and `C` that record their calls and
/// return the given dispositions.
fn register_all(
    handlers: &mut HandlerRegistry<Vec<u8>>,
    calls: &Calls,
    dispositions: [ExceptionDisposition; 3],
) {
    for (address, disposition) in [HANDLER_A, HANDLER_B, HANDLER_C]
        .into_iter()
        .zip(dispositions)
    {
        let calls = calls.clone();
        handlers.register_fn(address, move |_runtime, record, _frame, _context, _dc| {
            calls.borrow_mut().push((address, record.flags));
            disposition
        });
    }
}

/// Notes every frame the runtime virtually unwinds, by the pc it looks for
/// an epilogue at.
#[derive(Default)]
struct FrameRecorder {
    pcs: RefCell<Vec<u64>>,
}

impl InstructionDecoder for FrameRecorder {
    fn decode_epilogue(&self, pc: u64, code: &[u8], frame_register: Option<Reg>) -> Option<Epilogue> {
        self.pcs.borrow_mut().push(pc);
        Amd64EpilogueDecoder.decode_epilogue(pc, code, frame_register)
    }
}

#[test]
fn no_handlers_means_unhandled() {
    let fixture = Fixture::without_handlers();
    let handlers = HandlerRegistry::<Vec<u8>>::new();
    let recorder = FrameRecorder::default();
    let runtime = fixture.runtime(&handlers).with_decoder(&recorder);

    let mut record = record(ExceptionCode::ACCESS_VIOLATION);
    let mut context = fixture.fault_context();
    assert_eq!(runtime.dispatch_exception(&mut record, &mut context), Ok(false));
    assert_eq!(record.flags, ExceptionFlags::empty());
    assert_eq!(context, fixture.fault_context());
    assert_eq!(*recorder.pcs.borrow(), vec![C_FAULT, B_RET, A_RET]);

    // The same search again visits the same frames.
    recorder.pcs.borrow_mut().clear();
    assert_eq!(runtime.dispatch_exception(&mut record, &mut context), Ok(false));
    assert_eq!(*recorder.pcs.borrow(), vec![C_FAULT, B_RET, A_RET]);
}

#[test]
fn handlers_are_searched_innermost_first() {
    let fixture = Fixture::new();
    let calls = Calls::default();
    let mut handlers = HandlerRegistry::<Vec<u8>>::new();
    register_all(&mut handlers, &calls, [ExceptionDisposition::ContinueSearch; 3]);
    let runtime = fixture.runtime(&handlers);

    let mut record = record(ExceptionCode::ACCESS_VIOLATION);
    let mut context = fixture.fault_context();
    assert_eq!(runtime.dispatch_exception(&mut record, &mut context), Ok(false));
    assert_eq!(
        calls.borrow().iter().map(|(handler, _)| *handler).collect_vec(),
        vec![HANDLER_C, HANDLER_B, HANDLER_A]
    );
}

#[test]
fn continue_execution_resumes_with_repaired_context() {
    let fixture = Fixture::new();
    let mut handlers = HandlerRegistry::<Vec<u8>>::new();
    handlers.register_fn(HANDLER_C, |_runtime, _record, _frame, _context, _dc| {
        ExceptionDisposition::ContinueSearch
    });
    handlers.register_fn(HANDLER_B, |_runtime, record, frame, context, dc| {
        assert_eq!(record.code, ExceptionCode::INTEGER_DIVIDE_BY_ZERO);
        assert_eq!(frame, FRAME_B);
        assert_eq!(dc.control_pc, B_RET);
        assert_eq!(dc.function_entry.start_address(), B);
        assert_eq!(dc.image_base(), IMAGE_BASE);
        // The handler sees the faulting context, not its own frame's.
        assert_eq!(context.rip(), C_FAULT);
        // The dispatcher context holds the state after unwinding B.
        assert_eq!(dc.context_record.rip(), A_RET);
        assert_eq!(dc.context_record.get(Reg::RBP), SAVED_RBP);
        context.set_rip(C_FAULT + 2);
        ExceptionDisposition::ContinueExecution
    });
    let runtime = fixture.runtime(&handlers);

    let mut record = record(ExceptionCode::INTEGER_DIVIDE_BY_ZERO);
    let mut context = fixture.fault_context();
    assert_eq!(runtime.dispatch_exception(&mut record, &mut context), Ok(true));
    assert_eq!(context.rip(), C_FAULT + 2);
    assert_eq!(context.rsp(), FRAME_C);
}

#[test]
fn handler_data_follows_the_handler_address() {
    let fixture = Fixture::new();
    let seen = Rc::new(Cell::new(None));
    let mut handlers = HandlerRegistry::<Vec<u8>>::new();
    let seen_in_handler = seen.clone();
    handlers.register_fn(HANDLER_C, move |runtime, _record, _frame, _context, dc| {
        let image = runtime.directory().image_for(dc.handler_data).unwrap();
        let rva = image.rva_of(dc.handler_data).unwrap();
        seen_in_handler.set(Some(image.bytes_at_rva(rva).unwrap()[0]));
        ExceptionDisposition::ContinueExecution
    });
    let runtime = fixture.runtime(&handlers);

    let mut context = fixture.fault_context();
    assert_eq!(
        runtime.dispatch_exception(&mut record(ExceptionCode::BREAKPOINT), &mut context),
        Ok(true)
    );
    assert_eq!(seen.get(), Some(0xc));
}

#[test]
fn nested_exception_flag_lasts_until_the_nested_frame() {
    let fixture = Fixture::new();
    let calls = Calls::default();
    let mut handlers = HandlerRegistry::<Vec<u8>>::new();
    register_all(
        &mut handlers,
        &calls,
        [
            ExceptionDisposition::ContinueSearch,
            ExceptionDisposition::ContinueSearch,
            ExceptionDisposition::ContinueSearch,
        ],
    );
    // C reports that the exception was raised while an earlier dispatch was
    // running the handler of B's frame.
    let calls_in_c = calls.clone();
    handlers.register_fn(HANDLER_C, move |_runtime, record, _frame, _context, dc| {
        calls_in_c.borrow_mut().push((HANDLER_C, record.flags));
        dc.establisher_frame = FRAME_B;
        ExceptionDisposition::NestedException
    });
    let runtime = fixture.runtime(&handlers);

    let mut context = fixture.fault_context();
    assert_eq!(
        runtime.dispatch_exception(&mut record(ExceptionCode::ACCESS_VIOLATION), &mut context),
        Ok(false)
    );
    assert_eq!(
        *calls.borrow(),
        vec![
            (HANDLER_C, ExceptionFlags::empty()),
            (HANDLER_B, ExceptionFlags::NESTED_CALL),
            (HANDLER_A, ExceptionFlags::empty()),
        ]
    );
}

#[test]
fn collided_unwind_resumes_from_the_collision_frame() {
    let fixture = Fixture::new();
    let calls = Calls::default();
    let mut handlers = HandlerRegistry::<Vec<u8>>::new();
    register_all(&mut handlers, &calls, [ExceptionDisposition::ContinueSearch; 3]);
    let collisions = Rc::new(Cell::new(0));
    let calls_in_c = calls.clone();
    let collisions_in_c = collisions.clone();
    handlers.register_fn(HANDLER_C, move |runtime, record, _frame, _context, dc| {
        calls_in_c.borrow_mut().push((HANDLER_C, record.flags));
        collisions_in_c.set(collisions_in_c.get() + 1);
        // Pretend an unwind had already reached B's frame.
        let entry = runtime.directory().lookup_function_entry(B_RET, None).unwrap();
        dc.control_pc = B_RET;
        dc.function_entry = entry;
        dc.establisher_frame = FRAME_B;
        dc.language_handler = HANDLER_B;
        ExceptionDisposition::CollidedUnwind
    });
    let runtime = fixture.runtime(&handlers);

    let mut context = fixture.fault_context();
    assert_eq!(
        runtime.dispatch_exception(&mut record(ExceptionCode::ACCESS_VIOLATION), &mut context),
        Ok(false)
    );
    assert_eq!(collisions.get(), 1);
    assert_eq!(
        calls.borrow().iter().map(|(handler, _)| *handler).collect_vec(),
        vec![HANDLER_C, HANDLER_B, HANDLER_A]
    );
}

#[test]
fn invalid_disposition_is_an_error() {
    let fixture = Fixture::new();
    let mut handlers = HandlerRegistry::<Vec<u8>>::new();
    handlers.register_fn(HANDLER_C, |_runtime, _record, _frame, _context, _dc| {
        ExceptionDisposition::from_raw(7)
    });
    let runtime = fixture.runtime(&handlers);

    let mut context = fixture.fault_context();
    assert_eq!(
        runtime.dispatch_exception(&mut record(ExceptionCode::ACCESS_VIOLATION), &mut context),
        Err(Error::InvalidDisposition(7))
    );
}

#[test]
fn unregistered_handler_is_an_error() {
    let fixture = Fixture::new();
    let handlers = HandlerRegistry::<Vec<u8>>::new();
    let runtime = fixture.runtime(&handlers);

    let mut context = fixture.fault_context();
    assert_eq!(
        runtime.dispatch_exception(&mut record(ExceptionCode::ACCESS_VIOLATION), &mut context),
        Err(Error::UnknownHandler(HANDLER_C))
    );
}

#[test]
fn noncontinuable_exception_is_escalated() {
    let fixture = Fixture::new();
    let calls = Calls::default();
    let mut handlers = HandlerRegistry::<Vec<u8>>::new();
    register_all(&mut handlers, &calls, [ExceptionDisposition::ContinueSearch; 3]);
    handlers.register_fn(HANDLER_B, |_runtime, record, _frame, _context, _dc| {
        if record.code == ExceptionCode::NONCONTINUABLE_EXCEPTION {
            ExceptionDisposition::ContinueSearch
        } else {
            ExceptionDisposition::ContinueExecution
        }
    });
    let runtime = fixture.runtime(&handlers);

    let original = record(ExceptionCode::BREAKPOINT).noncontinuable();
    let mut context = fixture.fault_context();
    let RaiseOutcome::Unhandled(record) = runtime.raise_exception(original, &mut context) else {
        panic!("escalated exception should not be handled");
    };
    assert_eq!(
        record.chain().map(|r| r.code).collect_vec(),
        vec![ExceptionCode::NONCONTINUABLE_EXCEPTION, ExceptionCode::BREAKPOINT]
    );
    assert!(record.is_noncontinuable());
    assert_eq!(context, fixture.fault_context());
}

#[test]
fn stalled_walk_is_a_bad_function_table() {
    let mut fixture = Fixture::without_handlers();
    let mut context = fixture.make_machine_frame_loop();
    let handlers = HandlerRegistry::<Vec<u8>>::new();
    let runtime = fixture.runtime(&handlers);

    let mut record = ExceptionRecord::new(ExceptionCode::ACCESS_VIOLATION, context.rip());
    assert_eq!(
        runtime.dispatch_exception(&mut record, &mut context),
        Err(Error::BadFunctionTable)
    );
}

#[test]
fn repeated_failures_stop_escalating() {
    let mut fixture = Fixture::without_handlers();
    let mut context = fixture.make_machine_frame_loop();
    let handlers = HandlerRegistry::<Vec<u8>>::new();
    let runtime = fixture.runtime(&handlers).with_config(RuntimeConfig {
        max_nested_raises: 2,
        ..Default::default()
    });

    let record = ExceptionRecord::new(ExceptionCode::ACCESS_VIOLATION, context.rip());
    let RaiseOutcome::Unhandled(record) = runtime.raise_exception(record, &mut context) else {
        panic!("dispatch cannot succeed on a looping stack");
    };
    let codes = record.chain().map(|r| r.code).collect_vec();
    assert_eq!(codes.len(), 4);
    assert!(codes[..3]
        .iter()
        .all(|code| *code == ExceptionCode::BAD_FUNCTION_TABLE));
    assert_eq!(codes[3], ExceptionCode::ACCESS_VIOLATION);
}

#[test]
fn exception_log_records_handler_calls() {
    let fixture = Fixture::new();
    let calls = Calls::default();
    let mut handlers = HandlerRegistry::<Vec<u8>>::new();
    register_all(
        &mut handlers,
        &calls,
        [
            ExceptionDisposition::ContinueSearch,
            ExceptionDisposition::ContinueExecution,
            ExceptionDisposition::ContinueSearch,
        ],
    );
    let log = ExceptionLog::default();
    let runtime = fixture
        .runtime(&handlers)
        .with_exception_log(&log)
        .with_config(RuntimeConfig {
            exception_logging: true,
            ..Default::default()
        });

    let mut context = fixture.fault_context();
    assert_eq!(
        runtime.dispatch_exception(&mut record(ExceptionCode::ACCESS_VIOLATION), &mut context),
        Ok(true)
    );
    let records = log.records();
    assert_eq!(
        records
            .iter()
            .map(|r| (r.handler, r.establisher_frame, r.disposition))
            .collect_vec(),
        vec![
            (HANDLER_C, FRAME_C, Some(ExceptionDisposition::ContinueSearch)),
            (HANDLER_B, FRAME_B, Some(ExceptionDisposition::ContinueExecution)),
        ]
    );
    assert!(records.iter().tuple_windows().all(|(a, b)| a.control_pc != b.control_pc));
}
