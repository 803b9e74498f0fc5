//! End-to-end executor scenarios: control flow, error routing, messages.

use opseq_comm::{CommChannel, MessageKind};
use opseq_engine::{
    Context, EngineError, Executor, Sequence, Step, StepType, ABORT_PREFIX,
    ERROR_MESSAGE_VARIABLE,
};
use opseq_types::{VariableName, VariableValue};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn name(s: &str) -> VariableName {
    VariableName::new(s).expect("valid name")
}

fn step(step_type: StepType, script: &str, names: &[&str]) -> Step {
    Step::new(step_type)
        .with_script(script)
        .with_used_context_variable_names(names.iter().map(|n| name(n)))
}

fn run(sequence: &mut Sequence, context: &mut Context) -> Result<(), EngineError> {
    Executor::new().run(sequence, context, None)
}

fn drain(comm: &CommChannel) -> Vec<(MessageKind, Option<usize>)> {
    std::iter::from_fn(|| comm.try_recv())
        .map(|m| (m.kind, m.step_index))
        .collect()
}

// ── Linear execution ─────────────────────────────────────────────

#[test]
fn linear_actions_share_the_context() {
    let mut sequence = Sequence::new("linear").unwrap();
    sequence.add_step(step(StepType::Action, "a = 1", &["a"]));
    sequence.add_step(step(StepType::Action, "b = a + 2", &["a", "b"]));

    let mut context = Context::new();
    run(&mut sequence, &mut context).expect("run");

    assert_eq!(
        context.variables.get_str("a"),
        Some(&VariableValue::Integer(1))
    );
    assert_eq!(
        context.variables.get_str("b"),
        Some(&VariableValue::Integer(3))
    );
}

#[test]
fn empty_sequence_runs_cleanly() {
    let mut sequence = Sequence::new("empty").unwrap();
    let mut context = Context::new();
    run(&mut sequence, &mut context).expect("run");
}

// ── If chains ────────────────────────────────────────────────────

fn sign_sequence(first_script: &str) -> Sequence {
    let mut sequence = Sequence::new("sign").unwrap();
    sequence.add_step(step(StepType::Action, first_script, &["n"]));
    sequence.add_step(step(StepType::If, "return n > 0", &["n"]));
    sequence.add_step(step(StepType::Action, "sign = 1", &["sign"]));
    sequence.add_step(Step::new(StepType::Else));
    sequence.add_step(step(StepType::Action, "sign = -1", &["sign"]));
    sequence.add_step(Step::new(StepType::End));
    sequence
}

#[test]
fn if_branch_taken_for_positive_n() {
    let mut sequence = sign_sequence("n = 5");
    let mut context = Context::new();
    run(&mut sequence, &mut context).expect("run");

    assert_eq!(
        context.variables.get_str("n"),
        Some(&VariableValue::Integer(5))
    );
    assert_eq!(
        context.variables.get_str("sign"),
        Some(&VariableValue::Integer(1))
    );
}

#[test]
fn else_branch_taken_for_negative_n() {
    let mut sequence = sign_sequence("n = -5");
    let mut context = Context::new();
    run(&mut sequence, &mut context).expect("run");

    assert_eq!(
        context.variables.get_str("sign"),
        Some(&VariableValue::Integer(-1))
    );
}

#[test]
fn elseif_chain_takes_the_matching_branch() {
    let mut sequence = Sequence::new("classify").unwrap();
    sequence.add_step(step(StepType::Action, "n = 0", &["n"]));
    sequence.add_step(step(StepType::If, "return n > 0", &["n"]));
    sequence.add_step(step(StepType::Action, "class = 'positive'", &["class"]));
    sequence.add_step(step(StepType::ElseIf, "return n == 0", &["n"]));
    sequence.add_step(step(StepType::Action, "class = 'zero'", &["class"]));
    sequence.add_step(Step::new(StepType::Else));
    sequence.add_step(step(StepType::Action, "class = 'negative'", &["class"]));
    sequence.add_step(Step::new(StepType::End));

    let mut context = Context::new();
    run(&mut sequence, &mut context).expect("run");

    assert_eq!(
        context.variables.get_str("class"),
        Some(&VariableValue::from("zero"))
    );
}

#[test]
fn taken_branch_skips_the_rest_of_the_chain() {
    let mut sequence = Sequence::new("first wins").unwrap();
    sequence.add_step(step(StepType::Action, "hits = 0", &["hits"]));
    sequence.add_step(step(StepType::If, "return true", &[]));
    sequence.add_step(step(StepType::Action, "hits = hits + 1", &["hits"]));
    sequence.add_step(step(StepType::ElseIf, "return true", &[]));
    sequence.add_step(step(StepType::Action, "hits = hits + 10", &["hits"]));
    sequence.add_step(Step::new(StepType::Else));
    sequence.add_step(step(StepType::Action, "hits = hits + 100", &["hits"]));
    sequence.add_step(Step::new(StepType::End));
    sequence.add_step(step(StepType::Action, "hits = hits + 1000", &["hits"]));

    let mut context = Context::new();
    run(&mut sequence, &mut context).expect("run");

    assert_eq!(
        context.variables.get_str("hits"),
        Some(&VariableValue::Integer(1001))
    );
}

// ── While loops ──────────────────────────────────────────────────

#[test]
fn while_countdown_terminates_at_zero() {
    let comm = Arc::new(CommChannel::new(64));
    let mut sequence = Sequence::new("countdown").unwrap();
    sequence.add_step(step(StepType::Action, "i = 3", &["i"]));
    sequence.add_step(step(StepType::While, "return i > 0", &["i"]));
    sequence.add_step(step(StepType::Action, "i = i - 1", &["i"]));
    sequence.add_step(Step::new(StepType::End));

    let mut context = Context::new();
    Executor::new()
        .run(&mut sequence, &mut context, Some(&comm))
        .expect("run");

    assert_eq!(
        context.variables.get_str("i"),
        Some(&VariableValue::Integer(0))
    );

    // The while header (step index 1) evaluated exactly four times:
    // three true iterations plus the final false.
    let header_starts = drain(&comm)
        .iter()
        .filter(|(kind, index)| *kind == MessageKind::StepStarted && *index == Some(1))
        .count();
    assert_eq!(header_starts, 4);
}

#[test]
fn nested_if_inside_while() {
    let mut sequence = Sequence::new("evens").unwrap();
    sequence.add_step(step(StepType::Action, "i = 0 evens = 0", &["i", "evens"]));
    sequence.add_step(step(StepType::While, "return i < 5", &["i"]));
    sequence.add_step(step(StepType::If, "return i % 2 == 0", &["i"]));
    sequence.add_step(step(StepType::Action, "evens = evens + 1", &["evens"]));
    sequence.add_step(Step::new(StepType::End));
    sequence.add_step(step(StepType::Action, "i = i + 1", &["i"]));
    sequence.add_step(Step::new(StepType::End));

    let mut context = Context::new();
    run(&mut sequence, &mut context).expect("run");

    assert_eq!(
        context.variables.get_str("evens"),
        Some(&VariableValue::Integer(3))
    );
}

// ── Try / catch ──────────────────────────────────────────────────

#[test]
fn catch_handles_a_failing_step() {
    let comm = Arc::new(CommChannel::new(64));
    let mut sequence = Sequence::new("guarded").unwrap();
    sequence.add_step(Step::new(StepType::Try));
    sequence.add_step(step(StepType::Action, "error('boom')", &[]));
    sequence.add_step(Step::new(StepType::Catch));
    sequence.add_step(step(StepType::Action, "caught = 1", &["caught"]));
    sequence.add_step(Step::new(StepType::End));

    let mut context = Context::new();
    Executor::new()
        .run(&mut sequence, &mut context, Some(&comm))
        .expect("sequence must complete normally");

    assert_eq!(
        context.variables.get_str("caught"),
        Some(&VariableValue::Integer(1))
    );

    let messages = drain(&comm);
    let step_errors: Vec<_> = messages
        .iter()
        .filter(|(kind, _)| *kind == MessageKind::StepStoppedWithError)
        .collect();
    assert_eq!(step_errors, [&(MessageKind::StepStoppedWithError, Some(1))]);
    assert_eq!(
        messages.last(),
        Some(&(MessageKind::SequenceStopped, None))
    );
}

#[test]
fn catch_body_sees_the_error_message() {
    let mut sequence = Sequence::new("diagnose").unwrap();
    sequence.add_step(Step::new(StepType::Try));
    sequence.add_step(step(StepType::Action, "error('specific failure')", &[]));
    sequence.add_step(Step::new(StepType::Catch));
    sequence.add_step(step(
        StepType::Action,
        "seen = ERROR_MESSAGE",
        &["seen", ERROR_MESSAGE_VARIABLE],
    ));
    sequence.add_step(Step::new(StepType::End));

    let mut context = Context::new();
    run(&mut sequence, &mut context).expect("run");

    let seen = context
        .variables
        .get_str("seen")
        .and_then(VariableValue::as_text)
        .expect("seen variable");
    assert!(seen.contains("specific failure"), "got: {seen}");
    assert!(seen.contains("step 2"), "got: {seen}");
}

#[test]
fn catch_skipped_when_the_body_succeeds() {
    let mut sequence = Sequence::new("no error").unwrap();
    sequence.add_step(Step::new(StepType::Try));
    sequence.add_step(step(StepType::Action, "fine = 1", &["fine"]));
    sequence.add_step(Step::new(StepType::Catch));
    sequence.add_step(step(StepType::Action, "caught = 1", &["caught"]));
    sequence.add_step(Step::new(StepType::End));
    sequence.add_step(step(StepType::Action, "after = 1", &["after"]));

    let mut context = Context::new();
    run(&mut sequence, &mut context).expect("run");

    assert_eq!(context.variables.get_str("caught"), None);
    assert_eq!(
        context.variables.get_str("fine"),
        Some(&VariableValue::Integer(1))
    );
    assert_eq!(
        context.variables.get_str("after"),
        Some(&VariableValue::Integer(1))
    );
}

#[test]
fn error_in_catch_body_is_not_recaught() {
    let mut sequence = Sequence::new("double fault").unwrap();
    sequence.add_step(Step::new(StepType::Try));
    sequence.add_step(step(StepType::Action, "error('first')", &[]));
    sequence.add_step(Step::new(StepType::Catch));
    sequence.add_step(step(StepType::Action, "error('second')", &[]));
    sequence.add_step(Step::new(StepType::End));

    let mut context = Context::new();
    let err = run(&mut sequence, &mut context).unwrap_err();
    assert!(err.to_string().contains("second"));
}

#[test]
fn inner_error_is_caught_by_outer_try() {
    let mut sequence = Sequence::new("nested trys").unwrap();
    sequence.add_step(Step::new(StepType::Try));
    sequence.add_step(Step::new(StepType::Try));
    sequence.add_step(step(StepType::Action, "error('inner')", &[]));
    sequence.add_step(Step::new(StepType::Catch));
    sequence.add_step(step(StepType::Action, "error('from inner catch')", &[]));
    sequence.add_step(Step::new(StepType::End));
    sequence.add_step(Step::new(StepType::Catch));
    sequence.add_step(step(StepType::Action, "outer_caught = 1", &["outer_caught"]));
    sequence.add_step(Step::new(StepType::End));

    let mut context = Context::new();
    run(&mut sequence, &mut context).expect("outer catch handles it");

    assert_eq!(
        context.variables.get_str("outer_caught"),
        Some(&VariableValue::Integer(1))
    );
}

#[test]
fn failing_while_header_is_caught() {
    let mut sequence = Sequence::new("bad header").unwrap();
    sequence.add_step(Step::new(StepType::Try));
    sequence.add_step(step(StepType::While, "error('header')", &[]));
    sequence.add_step(step(StepType::Action, "unreached = 1", &["unreached"]));
    sequence.add_step(Step::new(StepType::End));
    sequence.add_step(Step::new(StepType::Catch));
    sequence.add_step(step(StepType::Action, "handled = 1", &["handled"]));
    sequence.add_step(Step::new(StepType::End));

    let mut context = Context::new();
    run(&mut sequence, &mut context).expect("run");

    assert_eq!(context.variables.get_str("unreached"), None);
    assert_eq!(
        context.variables.get_str("handled"),
        Some(&VariableValue::Integer(1))
    );
}

// ── Timeouts and termination ─────────────────────────────────────

#[test]
fn step_timeout_aborts_the_sequence() {
    let mut sequence = Sequence::new("stuck").unwrap();
    sequence.add_step(
        step(StepType::Action, "while true do end", &[])
            .with_timeout(chrono::Duration::milliseconds(50)),
    );

    let mut context = Context::new();
    let started = Instant::now();
    let err = run(&mut sequence, &mut context).unwrap_err();

    assert!(err.is_abort());
    assert!(err.to_string().contains("Timeout"), "got: {err}");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn timeout_is_not_caught_by_catch() {
    let mut sequence = Sequence::new("uncatchable").unwrap();
    sequence.add_step(Step::new(StepType::Try));
    sequence.add_step(
        step(StepType::Action, "while true do end", &[])
            .with_timeout(chrono::Duration::milliseconds(50)),
    );
    sequence.add_step(Step::new(StepType::Catch));
    sequence.add_step(step(StepType::Action, "caught = 1", &["caught"]));
    sequence.add_step(Step::new(StepType::End));

    let mut context = Context::new();
    let err = run(&mut sequence, &mut context).unwrap_err();

    assert!(err.is_abort());
    assert_eq!(context.variables.get_str("caught"), None);
}

#[test]
fn external_termination_aborts_with_prefix() {
    let comm = Arc::new(CommChannel::new(64));
    let canceller = Arc::clone(&comm);
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        canceller.request_termination();
    });

    let mut sequence = Sequence::new("cancelled").unwrap();
    sequence.add_step(step(StepType::Action, "while true do end", &[]));

    let mut context = Context::new();
    let started = Instant::now();
    let err = Executor::new()
        .run(&mut sequence, &mut context, Some(&comm))
        .unwrap_err();
    handle.join().expect("canceller thread");

    assert!(err.to_string().starts_with(ABORT_PREFIX), "got: {err}");
    assert!(started.elapsed() < Duration::from_secs(2));

    let messages = drain(&comm);
    assert_eq!(
        messages.last(),
        Some(&(MessageKind::SequenceStoppedWithError, None))
    );
}

// ── Preconditions and messages ───────────────────────────────────

#[test]
fn invalid_structure_fails_before_any_step_runs() {
    let comm = Arc::new(CommChannel::new(64));
    let mut sequence = Sequence::new("broken").unwrap();
    sequence.add_step(step(StepType::Action, "ran = 1", &["ran"]));
    sequence.add_step(Step::new(StepType::End));

    let mut context = Context::new();
    let err = Executor::new()
        .run(&mut sequence, &mut context, Some(&comm))
        .unwrap_err();

    assert!(matches!(err, EngineError::PreconditionFailed(_)));
    assert_eq!(context.variables.get_str("ran"), None);
    assert!(comm.try_recv().is_none(), "nothing may be emitted");
}

#[test]
fn message_order_for_a_linear_run() {
    let comm = Arc::new(CommChannel::new(64));
    let mut sequence = Sequence::new("two steps").unwrap();
    sequence.add_step(step(StepType::Action, "x = 1", &[]));
    sequence.add_step(step(StepType::Action, "y = 2", &[]));

    let mut context = Context::new();
    Executor::new()
        .run(&mut sequence, &mut context, Some(&comm))
        .expect("run");

    assert_eq!(
        drain(&comm),
        [
            (MessageKind::SequenceStarted, None),
            (MessageKind::StepStarted, Some(0)),
            (MessageKind::StepStopped, Some(0)),
            (MessageKind::StepStarted, Some(1)),
            (MessageKind::StepStopped, Some(1)),
            (MessageKind::SequenceStopped, None),
        ]
    );
}

#[test]
fn uncaught_error_reports_sequence_stopped_with_error() {
    let comm = Arc::new(CommChannel::new(64));
    let mut sequence = Sequence::new("failing").unwrap();
    sequence.add_step(step(StepType::Action, "error('unhandled')", &[]));

    let mut context = Context::new();
    let err = Executor::new()
        .run(&mut sequence, &mut context, Some(&comm))
        .unwrap_err();
    assert!(matches!(err, EngineError::Script { step: 1, .. }));

    assert_eq!(
        drain(&comm),
        [
            (MessageKind::SequenceStarted, None),
            (MessageKind::StepStarted, Some(0)),
            (MessageKind::StepStoppedWithError, Some(0)),
            (MessageKind::SequenceStoppedWithError, None),
        ]
    );
}

// ── Declared-variable discipline across a whole run ──────────────

#[test]
fn only_declared_names_change_in_the_context() {
    let mut sequence = Sequence::new("discipline").unwrap();
    sequence.add_step(step(StepType::Action, "a = 10 b = 20", &["a"]));

    let mut context = Context::new();
    context.variables.set(name("b"), 1i64);
    context.variables.set(name("untouched"), "before");
    run(&mut sequence, &mut context).expect("run");

    assert_eq!(
        context.variables.get_str("a"),
        Some(&VariableValue::Integer(10))
    );
    // "b" was assigned in the script but not declared by the step.
    assert_eq!(
        context.variables.get_str("b"),
        Some(&VariableValue::Integer(1))
    );
    assert_eq!(
        context.variables.get_str("untouched"),
        Some(&VariableValue::from("before"))
    );
}
