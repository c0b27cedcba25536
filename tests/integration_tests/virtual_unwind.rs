use sehunwind::x86_64::UnwindInfoFlags;
use sehunwind::*;

use super::common::*;

fn entry(fixture: &Fixture, pc: u64) -> FunctionEntry {
    fixture
        .directory
        .lookup_function_entry(pc, None)
        .expect("pc should be covered by the function table")
}

#[test]
fn body_restores_saved_registers() {
    let fixture = Fixture::new();
    let handlers = HandlerRegistry::new();
    let runtime = fixture.runtime(&handlers);

    let mut context = fixture.fault_context();
    let mut pointers = ContextPointers::new();
    let unwind = runtime
        .virtual_unwind(
            UnwindInfoFlags::EXCEPTION_HANDLER,
            C_FAULT,
            &entry(&fixture, C_FAULT),
            &mut context,
            Some(&mut pointers),
        )
        .unwrap();
    assert_eq!(unwind.establisher_frame, FRAME_C);
    assert_eq!(
        unwind.handler,
        Some(HandlerRef {
            address: HANDLER_C,
            data: IMAGE_BASE + 0x88c,
        })
    );
    assert_eq!((context.rip(), context.rsp()), (B_RET, FRAME_B));
    assert_eq!(context.get(Reg::RSI), SAVED_RSI);
    assert_eq!(pointers.integer(Reg::RSI), Some(FRAME_B - 0x10));
    assert_eq!(pointers.integer(Reg::RBX), None);
}

#[test]
fn handler_type_must_match() {
    let fixture = Fixture::new();
    let handlers = HandlerRegistry::new();
    let runtime = fixture.runtime(&handlers);

    // A only has an exception handler.
    let mut context = Context::new(A_RET, FRAME_A);
    let unwind = runtime
        .virtual_unwind(
            UnwindInfoFlags::TERMINATION_HANDLER,
            A_RET,
            &entry(&fixture, A_RET),
            &mut context,
            None,
        )
        .unwrap();
    assert_eq!(unwind.handler, None);

    let mut context = Context::new(A_RET, FRAME_A);
    let unwind = runtime
        .virtual_unwind(
            UnwindInfoFlags::EXCEPTION_HANDLER,
            A_RET,
            &entry(&fixture, A_RET),
            &mut context,
            None,
        )
        .unwrap();
    assert_eq!(unwind.handler.map(|handler| handler.address), Some(HANDLER_A));
    assert_eq!((context.rip(), context.rsp()), (OUTER, STACK_HIGH));
}

#[test]
fn partially_executed_prologue() {
    let fixture = Fixture::new();
    let handlers = HandlerRegistry::new();
    let runtime = fixture.runtime(&handlers);

    // After `push rbx`, before `sub rsp, 0x20`.
    let pc = A + 1;
    let mut context = Context::new(pc, STACK_HIGH - 0x10);
    let unwind = runtime
        .virtual_unwind(
            UnwindInfoFlags::EXCEPTION_HANDLER,
            pc,
            &entry(&fixture, pc),
            &mut context,
            None,
        )
        .unwrap();
    assert_eq!(unwind.establisher_frame, STACK_HIGH - 0x10);
    // No handler runs for a frame that has not finished its prologue.
    assert_eq!(unwind.handler, None);
    assert_eq!(context.get(Reg::RBX), SAVED_RBX);
    assert_eq!((context.rip(), context.rsp()), (OUTER, STACK_HIGH));
}

#[test]
fn epilogue_is_emulated() {
    let fixture = Fixture::new();
    let handlers = HandlerRegistry::new();
    let runtime = fixture.runtime(&handlers);

    let mut context = Context::new(A_EPILOGUE, FRAME_A);
    let unwind = runtime
        .virtual_unwind(
            UnwindInfoFlags::EXCEPTION_HANDLER,
            A_EPILOGUE,
            &entry(&fixture, A_EPILOGUE),
            &mut context,
            None,
        )
        .unwrap();
    assert_eq!(unwind.establisher_frame, FRAME_A);
    assert_eq!(unwind.handler, None);
    assert_eq!(context.get(Reg::RBX), SAVED_RBX);
    assert_eq!((context.rip(), context.rsp()), (OUTER, STACK_HIGH));
}

#[test]
fn chained_fragment_uses_primary_prologue() {
    let mut fixture = Fixture::without_handlers();
    let rsp = STACK_LOW + 0x30;
    assert!(fixture.stack.write_u64(rsp + 0x20, 0xe0e0));
    assert!(fixture.stack.write_u64(rsp + 0x28, A_RET));
    let handlers = HandlerRegistry::new();
    let runtime = fixture.runtime(&handlers);

    let pc = E_COLD + 0x10;
    let function = entry(&fixture, pc);
    assert_eq!(
        fixture.directory.primary_function_entry(&function).map(|e| e.start_address()),
        Some(E)
    );

    let mut context = Context::new(pc, rsp);
    runtime
        .virtual_unwind(UnwindInfoFlags::empty(), pc, &function, &mut context, None)
        .unwrap();
    assert_eq!(context.get(Reg::RBX), 0xe0e0);
    assert_eq!((context.rip(), context.rsp()), (A_RET, rsp + 0x30));
}

#[test]
fn machine_frame_restores_ip_and_stack() {
    let mut fixture = Fixture::without_handlers();
    let rsp = STACK_LOW + 0x40;
    assert!(fixture.stack.write_u64(rsp, B_RET));
    assert!(fixture.stack.write_u64(rsp + 24, FRAME_B));
    let handlers = HandlerRegistry::new();
    let runtime = fixture.runtime(&handlers);

    let mut context = Context::new(D + 0x8, rsp);
    runtime
        .virtual_unwind(
            UnwindInfoFlags::empty(),
            D + 0x8,
            &entry(&fixture, D),
            &mut context,
            None,
        )
        .unwrap();
    assert_eq!((context.rip(), context.rsp()), (B_RET, FRAME_B));
}

#[test]
fn unreadable_stack_is_an_error() {
    let fixture = Fixture::new();
    let handlers = HandlerRegistry::new();
    let runtime = fixture.runtime(&handlers);

    let mut context = Context::new(C_FAULT, STACK_HIGH);
    assert_eq!(
        runtime.virtual_unwind(
            UnwindInfoFlags::empty(),
            C_FAULT,
            &entry(&fixture, C_FAULT),
            &mut context,
            None,
        ),
        Err(Error::CouldNotReadStack(STACK_HIGH + 0x20))
    );
}

/// Unwinds `F` from `pc` with the given stack and frame registers.
fn unwind_f(pc: u64, rsp: u64, rbp: u64) -> (VirtualUnwind, Context, ContextPointers) {
    let mut fixture = Fixture::new();
    fixture.make_frame_pointer_frame();
    let handlers = HandlerRegistry::new();
    let runtime = fixture.runtime(&handlers);

    let mut context = Context::new(pc, rsp);
    context.set(Reg::RBP, rbp);
    let mut pointers = ContextPointers::new();
    let unwind = runtime
        .virtual_unwind(
            UnwindInfoFlags::EXCEPTION_HANDLER,
            pc,
            &entry(&fixture, pc),
            &mut context,
            Some(&mut pointers),
        )
        .unwrap();
    (unwind, context, pointers)
}

fn assert_returned_to_a(context: &Context) {
    assert_eq!((context.rip(), context.rsp()), (A_RET, F_ENTRY_RSP + 8));
    assert_eq!(context.get(Reg::RBP), SAVED_RBP);
}

#[test]
fn frame_register_is_the_establisher_in_the_body() {
    // The body has pushed more onto the stack; only RBP still locates the frame.
    let (unwind, context, pointers) = unwind_f(F_BODY, F_BODY_RSP - 0x30, F_RBP);
    assert_eq!(unwind.establisher_frame, F_FRAME);
    assert_returned_to_a(&context);
    assert_eq!(pointers.integer(Reg::RBP), Some(F_FRAME));
}

#[test]
fn frame_register_is_ignored_before_the_prologue_sets_it() {
    // After `push rbp`: RBP still holds the caller's value.
    let (unwind, context, _) = unwind_f(F + 1, F_FRAME, 0x5252);
    assert_eq!(unwind.establisher_frame, F_FRAME);
    assert_returned_to_a(&context);

    // After `lea rbp, [rsp+0x20]`, before `sub rsp, 0x40`.
    let (unwind, context, _) = unwind_f(F + 6, F_FRAME, F_RBP);
    assert_eq!(unwind.establisher_frame, F_FRAME);
    assert_returned_to_a(&context);
}

#[test]
fn lea_epilogue_restores_from_the_frame_register() {
    let (unwind, context, pointers) = unwind_f(F_EPILOGUE, F_BODY_RSP - 0x30, F_RBP);
    assert_eq!(unwind.establisher_frame, F_FRAME);
    assert_eq!(unwind.handler, None);
    assert_returned_to_a(&context);
    assert_eq!(pointers.integer(Reg::RBP), Some(F_FRAME));

    let (unwind, context, _) = unwind_f(F_TAIL_CALL, F_BODY_RSP, F_RBP);
    assert_eq!(unwind.establisher_frame, F_FRAME);
    assert_returned_to_a(&context);
}

#[test]
fn jumps_decide_whether_an_epilogue_leaves_the_function() {
    let fixture = Fixture::new();
    let handlers = HandlerRegistry::new();
    let runtime = fixture.runtime(&handlers);

    // A jump to another function is a tail call: no handler runs.
    let mut context = Context::new(A_TAIL_CALL, FRAME_A);
    let unwind = runtime
        .virtual_unwind(
            UnwindInfoFlags::EXCEPTION_HANDLER,
            A_TAIL_CALL,
            &entry(&fixture, A_TAIL_CALL),
            &mut context,
            None,
        )
        .unwrap();
    assert_eq!(unwind.handler, None);
    assert_eq!(context.get(Reg::RBX), SAVED_RBX);
    assert_eq!((context.rip(), context.rsp()), (OUTER, STACK_HIGH));

    // A jump back into the body is not an epilogue; the frame is still live.
    let mut context = Context::new(A_INNER_BRANCH, FRAME_A);
    let unwind = runtime
        .virtual_unwind(
            UnwindInfoFlags::EXCEPTION_HANDLER,
            A_INNER_BRANCH,
            &entry(&fixture, A_INNER_BRANCH),
            &mut context,
            None,
        )
        .unwrap();
    assert_eq!(unwind.handler.map(|handler| handler.address), Some(HANDLER_A));
    assert_eq!(context.get(Reg::RBX), SAVED_RBX);
    assert_eq!((context.rip(), context.rsp()), (OUTER, STACK_HIGH));
}

#[test]
fn reentering_the_prologue_restores_the_frame() {
    let mut fixture = Fixture::without_handlers();
    let handlers = HandlerRegistry::new();

    // B right after its prologue, `push rbp; sub rsp, 0x10`.
    let end_of_prologue = B + 5;
    let mut original = Context::new(end_of_prologue, FRAME_B);
    original.set(Reg::RBX, 0x5353);
    original.set(Reg::RBP, SAVED_RBP);
    original.set(Reg::RSI, 0x5151);

    let mut context = original.clone();
    fixture
        .runtime(&handlers)
        .virtual_unwind(
            UnwindInfoFlags::empty(),
            end_of_prologue,
            &entry(&fixture, end_of_prologue),
            &mut context,
            None,
        )
        .unwrap();
    assert_eq!((context.rip(), context.rsp()), (A_RET, FRAME_A));

    // call B
    let rsp = context.rsp() - 8;
    assert!(fixture.stack.write_u64(rsp, context.rip()));
    context.set_rsp(rsp);
    // push rbp
    let rsp = context.rsp() - 8;
    assert!(fixture.stack.write_u64(rsp, context.get(Reg::RBP)));
    context.set_rsp(rsp);
    // sub rsp, 0x10
    context.set_rsp(context.rsp() - 0x10);
    context.set_rip(end_of_prologue);

    assert_eq!(context, original);
}
