// Integration tests for the dialogue VM.
//
// These tests assemble small compiled programs in memory and drive the
// VM the way a host would: pump instructions while it runs, answer
// option prompts, tick the clock for waits. Covered here:
// - Instruction semantics (stack discipline, jumps, variables, options)
// - The running state machine and its transitions
// - Builtin function dispatch through CALL_FUNC
// - Determinism and save/restore round trips

use prost::Message;
use spool::bytecode::{Instruction, Node, OpCode, Operand, Program};
use spool::value::Value;
use spool::vm::{DialogueCallbacks, DialogueOption, Line, RunningState, VmSettings, YarnVm};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Records every callback the VM raises, in order.
#[derive(Default)]
struct Recorder {
    lines: Vec<Line>,
    commands: Vec<String>,
    options: Vec<Vec<DialogueOption>>,
    node_changes: Vec<(Option<String>, String)>,
    stopped: usize,
}

impl DialogueCallbacks for Recorder {
    fn on_line(&mut self, line: &Line) {
        self.lines.push(line.clone());
    }

    fn on_command(&mut self, command: &str) {
        self.commands.push(command.to_string());
    }

    fn on_options(&mut self, options: &[DialogueOption]) {
        self.options.push(options.to_vec());
    }

    fn on_node_changed(&mut self, from: Option<&str>, to: &str) {
        self.node_changes.push((from.map(str::to_string), to.to_string()));
    }

    fn on_stopped(&mut self) {
        self.stopped += 1;
    }
}

fn node(name: &str, instructions: Vec<Instruction>, labels: &[(&str, i32)]) -> Node {
    Node {
        name: name.to_string(),
        instructions,
        labels: labels.iter().map(|(label, index)| (label.to_string(), *index)).collect(),
        tags: vec![],
        source_text_string_id: String::new(),
        headers: vec![],
    }
}

fn program(nodes: Vec<Node>) -> Program {
    Program {
        name: "test".to_string(),
        nodes: nodes.into_iter().map(|n| (n.name.clone(), n)).collect(),
        initial_values: HashMap::new(),
    }
}

fn start_vm(program: Program, settings: VmSettings) -> (YarnVm, Recorder) {
    let mut vm = YarnVm::new(settings);
    vm.install_program(program);
    let mut recorder = Recorder::default();
    vm.load_node("Start", &mut recorder).unwrap();
    (vm, recorder)
}

fn run_until_blocked(vm: &mut YarnVm, recorder: &mut Recorder) {
    while vm.state() == RunningState::Running {
        let instruction = vm.current_instruction().unwrap().clone();
        vm.process_instruction(&instruction, recorder).unwrap();
    }
}

// Instruction shorthands

fn push_f(n: f32) -> Instruction {
    Instruction::new(OpCode::PushFloat, vec![Operand::number(n)])
}

fn push_s(s: &str) -> Instruction {
    Instruction::new(OpCode::PushString, vec![Operand::string(s)])
}

fn push_b(b: bool) -> Instruction {
    Instruction::new(OpCode::PushBool, vec![Operand::boolean(b)])
}

fn push_var(name: &str) -> Instruction {
    Instruction::new(OpCode::PushVariable, vec![Operand::string(name)])
}

fn store(name: &str) -> Instruction {
    Instruction::new(OpCode::StoreVariable, vec![Operand::string(name)])
}

fn call(name: &str) -> Instruction {
    Instruction::new(OpCode::CallFunc, vec![Operand::string(name)])
}

fn jump_to(label: &str) -> Instruction {
    Instruction::new(OpCode::JumpTo, vec![Operand::string(label)])
}

fn jump_if_false(label: &str) -> Instruction {
    Instruction::new(OpCode::JumpIfFalse, vec![Operand::string(label)])
}

fn jump() -> Instruction {
    Instruction::new(OpCode::Jump, vec![])
}

fn run_command(text: &str) -> Instruction {
    Instruction::new(OpCode::RunCommand, vec![Operand::string(text)])
}

fn add_option(id: &str, destination: &str) -> Instruction {
    Instruction::new(OpCode::AddOption, vec![Operand::string(id), Operand::string(destination)])
}

fn show_options() -> Instruction {
    Instruction::new(OpCode::ShowOptions, vec![])
}

fn run_node() -> Instruction {
    Instruction::new(OpCode::RunNode, vec![])
}

fn stop() -> Instruction {
    Instruction::new(OpCode::Stop, vec![])
}

fn temp_file(stem: &str) -> std::path::PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("spool_vm_{}_{}_{}", stem, std::process::id(), unique))
}

#[test]
fn test_arithmetic_via_the_stack() {
    let program = program(vec![node(
        "Start",
        vec![push_f(3.0), push_f(4.0), push_f(2.0), call("Number.Add"), store("$x"), stop()],
        &[],
    )]);
    let (mut vm, mut recorder) = start_vm(program, VmSettings::default());

    run_until_blocked(&mut vm, &mut recorder);

    assert_eq!(vm.variable("$x"), Some(&Value::Number(7.0)));
    assert_eq!(vm.state(), RunningState::Stopped);
    // StoreVariable peeks, so the result stays on the stack.
    assert_eq!(vm.stack().len(), 1);
    assert_eq!(recorder.stopped, 1);
}

#[test]
fn test_options_and_branching() {
    let program = program(vec![node(
        "Start",
        vec![
            add_option("line:yes", "yes"),
            add_option("line:no", "no"),
            show_options(),
            jump(),
            stop(),
            stop(),
        ],
        &[("yes", 4), ("no", 5)],
    )]);
    let (mut vm, mut recorder) = start_vm(program, VmSettings::default());

    run_until_blocked(&mut vm, &mut recorder);

    assert_eq!(vm.state(), RunningState::AwaitingInput);
    assert_eq!(recorder.options.len(), 1);
    let presented = &recorder.options[0];
    assert_eq!(presented.len(), 2);
    assert_eq!(presented[0].destination, "yes");
    assert_eq!(presented[1].destination, "no");
    assert!(presented.iter().all(|option| option.enabled));

    vm.select_option(0).unwrap();
    assert_eq!(vm.state(), RunningState::Running);
    assert_eq!(vm.stack().last(), Some(&Value::String("yes".to_string())));
    assert!(vm.options().is_empty());

    // The JUMP after SHOW_OPTIONS consumes the pushed destination.
    let instruction = vm.current_instruction().unwrap().clone();
    vm.process_instruction(&instruction, &mut recorder).unwrap();
    assert_eq!(vm.instruction_pointer(), 4);
    assert!(vm.stack().is_empty());
}

#[test]
fn test_selecting_the_same_option_is_deterministic() {
    let build = || {
        program(vec![node(
            "Start",
            vec![add_option("line:a", "a"), show_options(), jump(), stop()],
            &[("a", 3)],
        )])
    };

    let mut pointers = vec![];
    for _ in 0..2 {
        let (mut vm, mut recorder) = start_vm(build(), VmSettings::default());
        run_until_blocked(&mut vm, &mut recorder);
        vm.select_option(0).unwrap();
        run_until_blocked(&mut vm, &mut recorder);
        pointers.push(vm.instruction_pointer());
    }
    assert_eq!(pointers[0], pointers[1]);
}

#[test]
fn test_show_options_requires_a_pending_list() {
    let program = program(vec![node("Start", vec![show_options(), stop()], &[])]);
    let (mut vm, mut recorder) = start_vm(program, VmSettings::default());

    let instruction = vm.current_instruction().unwrap().clone();
    let result = vm.process_instruction(&instruction, &mut recorder);

    assert!(result.is_err());
    assert_eq!(vm.state(), RunningState::Stopped);
    assert_eq!(recorder.stopped, 1);
}

#[test]
fn test_select_option_outside_awaiting_input_is_rejected() {
    let program = program(vec![node("Start", vec![stop()], &[])]);
    let (mut vm, _recorder) = start_vm(program, VmSettings::default());

    assert!(vm.select_option(0).is_err());
}

#[test]
fn test_select_option_index_out_of_range_is_rejected() {
    let program = program(vec![node(
        "Start",
        vec![add_option("line:a", "a"), show_options(), jump(), stop()],
        &[("a", 3)],
    )]);
    let (mut vm, mut recorder) = start_vm(program, VmSettings::default());
    run_until_blocked(&mut vm, &mut recorder);

    assert!(vm.select_option(5).is_err());
}

#[test]
fn test_wait_and_wake_on_the_clock() {
    let program = program(vec![node("Start", vec![run_command("wait 500"), stop()], &[])]);
    let (mut vm, mut recorder) = start_vm(program, VmSettings::default());

    let instruction = vm.current_instruction().unwrap().clone();
    vm.process_instruction(&instruction, &mut recorder).unwrap();
    assert_eq!(recorder.commands, vec!["wait 500".to_string()]);

    // The host translates the command into a wait.
    vm.set_time(1000);
    vm.set_wait_time(500).unwrap();
    assert_eq!(vm.state(), RunningState::Asleep);
    assert_eq!(vm.wait_until_time(), 1500);

    vm.increment_time(499);
    assert_eq!(vm.state(), RunningState::Asleep);

    vm.increment_time(1);
    assert_eq!(vm.state(), RunningState::Running);
}

#[test]
fn test_wait_while_stopped_is_rejected() {
    let program = program(vec![node("Start", vec![stop()], &[])]);
    let (mut vm, mut recorder) = start_vm(program, VmSettings::default());
    run_until_blocked(&mut vm, &mut recorder);

    assert!(vm.set_wait_time(100).is_err());
}

#[test]
fn test_stopped_vm_rejects_further_instructions() {
    let program = program(vec![node("Start", vec![stop()], &[])]);
    let (mut vm, mut recorder) = start_vm(program, VmSettings::default());
    run_until_blocked(&mut vm, &mut recorder);
    assert_eq!(vm.state(), RunningState::Stopped);

    let result = vm.process_instruction(&stop(), &mut recorder);
    assert!(result.is_err());
    assert_eq!(vm.state(), RunningState::Stopped);
    // The stopped hook fired once, on the STOP instruction only.
    assert_eq!(recorder.stopped, 1);
}

#[test]
fn test_load_node_resets_the_pointer_and_fires_the_hook() {
    let program = program(vec![
        node("Start", vec![jump_to("skip"), stop(), stop()], &[("skip", 2)]),
        node("Second", vec![stop()], &[]),
    ]);
    let (mut vm, mut recorder) = start_vm(program, VmSettings::default());

    assert_eq!(vm.instruction_pointer(), 0);
    assert_eq!(vm.state(), RunningState::Running);
    assert_eq!(recorder.node_changes, vec![(None, "Start".to_string())]);

    let instruction = vm.current_instruction().unwrap().clone();
    vm.process_instruction(&instruction, &mut recorder).unwrap();
    assert_eq!(vm.instruction_pointer(), 2);

    vm.load_node("Second", &mut recorder).unwrap();
    assert_eq!(vm.instruction_pointer(), 0);
    assert_eq!(
        recorder.node_changes.last(),
        Some(&(Some("Start".to_string()), "Second".to_string()))
    );
}

#[test]
fn test_run_node_switches_nodes_through_the_stack() {
    let program = program(vec![
        node("Start", vec![push_s("Second"), run_node()], &[]),
        node("Second", vec![stop()], &[]),
    ]);
    let (mut vm, mut recorder) = start_vm(program, VmSettings::default());

    run_until_blocked(&mut vm, &mut recorder);

    assert_eq!(vm.state(), RunningState::Stopped);
    assert_eq!(vm.current_node(), Some("Second"));
    assert_eq!(recorder.node_changes.len(), 2);
}

#[test]
fn test_jump_if_false_peeks_without_popping() {
    let program = program(vec![node(
        "Start",
        vec![push_b(false), jump_if_false("end"), push_f(99.0), stop()],
        &[("end", 3)],
    )]);
    let (mut vm, mut recorder) = start_vm(program, VmSettings::default());

    run_until_blocked(&mut vm, &mut recorder);

    // The branch was taken and the condition value is still on the stack.
    assert_eq!(vm.stack(), &[Value::Bool(false)]);
}

#[test]
fn test_jump_if_false_falls_through_on_truthy_values() {
    let program = program(vec![node(
        "Start",
        vec![push_s("truthy"), jump_if_false("end"), push_f(99.0), stop()],
        &[("end", 3)],
    )]);
    let (mut vm, mut recorder) = start_vm(program, VmSettings::default());

    run_until_blocked(&mut vm, &mut recorder);

    assert_eq!(vm.stack().len(), 2);
    assert_eq!(vm.stack().last(), Some(&Value::Number(99.0)));
}

#[test]
fn test_missing_variable_reads_as_null() {
    let program = program(vec![node("Start", vec![push_var("$undefined"), stop()], &[])]);
    let (mut vm, mut recorder) = start_vm(program, VmSettings::default());

    run_until_blocked(&mut vm, &mut recorder);

    assert_eq!(vm.stack(), &[Value::Null]);
}

#[test]
fn test_initial_values_seed_the_variable_store() {
    let mut prog = program(vec![node("Start", vec![stop()], &[])]);
    prog.initial_values.insert("$gold".to_string(), Operand::number(10.0));
    prog.initial_values
        .insert("$Yarn.Internal.Visiting.Cellar".to_string(), Operand::number(3.0));

    let (vm, _recorder) = start_vm(prog, VmSettings::default());

    assert_eq!(vm.variable("$gold"), Some(&Value::Number(10.0)));
    assert_eq!(vm.visited_count("Cellar"), 3);
    assert_eq!(vm.visited_count("Attic"), 0);
}

#[test]
fn test_visited_builtin_through_call_func() {
    let mut prog = program(vec![node(
        "Start",
        vec![push_s("Cellar"), push_f(1.0), call("visited"), store("$seen"), stop()],
        &[],
    )]);
    prog.initial_values
        .insert("$Yarn.Internal.Visiting.Cellar".to_string(), Operand::number(2.0));
    let (mut vm, mut recorder) = start_vm(prog, VmSettings::default());

    run_until_blocked(&mut vm, &mut recorder);

    assert_eq!(vm.variable("$seen"), Some(&Value::Bool(true)));
}

#[test]
fn test_call_to_unregistered_function_stops_in_strict_mode() {
    let program =
        program(vec![node("Start", vec![push_f(0.0), call("no_such_function"), stop()], &[])]);
    let (mut vm, mut recorder) = start_vm(program, VmSettings::default());

    let mut failed = false;
    while vm.state() == RunningState::Running {
        let instruction = vm.current_instruction().unwrap().clone();
        if vm.process_instruction(&instruction, &mut recorder).is_err() {
            failed = true;
        }
    }

    assert!(failed);
    assert_eq!(vm.state(), RunningState::Stopped);
    assert_eq!(recorder.stopped, 1);
}

#[test]
fn test_host_registered_functions_are_callable() {
    let program = program(vec![node(
        "Start",
        vec![push_f(2.0), push_f(1.0), call("double"), store("$result"), stop()],
        &[],
    )]);
    let (mut vm, mut recorder) = start_vm(program, VmSettings::default());
    vm.register_function("double", |vm, parameters| {
        assert_eq!(parameters, 1);
        let n = vm.pop_number()?;
        Ok(Value::Number(n * 2.0))
    });

    run_until_blocked(&mut vm, &mut recorder);

    assert_eq!(vm.variable("$result"), Some(&Value::Number(4.0)));
}

#[test]
fn test_jump_to_missing_label_stops_in_strict_mode() {
    let program = program(vec![node("Start", vec![jump_to("nowhere"), stop()], &[])]);
    let (mut vm, mut recorder) = start_vm(program, VmSettings::default());

    let instruction = vm.current_instruction().unwrap().clone();
    assert!(vm.process_instruction(&instruction, &mut recorder).is_err());
    assert_eq!(vm.state(), RunningState::Stopped);
}

#[test]
fn test_lax_mode_skips_failing_instructions() {
    let settings = VmSettings { enable_exceptions: false, ..VmSettings::default() };
    let program = program(vec![node(
        "Start",
        vec![Instruction::new(OpCode::Pop, vec![]), push_f(1.0), stop()],
        &[],
    )]);
    let (mut vm, mut recorder) = start_vm(program, settings);

    run_until_blocked(&mut vm, &mut recorder);

    // The empty-stack pop was skipped; the rest of the node ran.
    assert_eq!(vm.state(), RunningState::Stopped);
    assert_eq!(vm.stack(), &[Value::Number(1.0)]);
    assert_eq!(recorder.stopped, 1);
}

#[test]
fn test_lax_mode_skips_run_node_to_a_missing_node() {
    let settings = VmSettings { enable_exceptions: false, ..VmSettings::default() };
    let program =
        program(vec![node("Start", vec![push_s("Ghost"), run_node(), stop()], &[])]);
    let (mut vm, mut recorder) = start_vm(program, settings);

    run_until_blocked(&mut vm, &mut recorder);

    // The missing node was skipped and execution reached the STOP.
    assert_eq!(vm.state(), RunningState::Stopped);
    assert_eq!(vm.current_node(), Some("Start"));
    assert_eq!(recorder.node_changes.len(), 1);
    assert_eq!(recorder.stopped, 1);
}

#[test]
fn test_identical_seeds_produce_identical_runs() {
    let build = || {
        let mut prog = program(vec![node(
            "Start",
            vec![
                push_f(20.0),
                push_f(1.0),
                call("dice"),
                store("$roll"),
                Instruction::new(OpCode::Pop, vec![]),
                push_f(0.0),
                call("random"),
                store("$chance"),
                stop(),
            ],
            &[],
        )]);
        prog.initial_values.insert("$gold".to_string(), Operand::number(5.0));
        prog
    };
    let settings = VmSettings { random_seed: 42, ..VmSettings::default() };

    let (mut first, mut first_recorder) = start_vm(build(), settings.clone());
    let (mut second, mut second_recorder) = start_vm(build(), settings);

    run_until_blocked(&mut first, &mut first_recorder);
    run_until_blocked(&mut second, &mut second_recorder);

    assert_eq!(first.variable("$roll"), second.variable("$roll"));
    assert_eq!(first.variable("$chance"), second.variable("$chance"));
    assert_eq!(first.to_save().unwrap(), second.to_save().unwrap());
}

#[test]
fn test_save_restore_round_trip_preserves_state_and_rng() {
    // The program pauses at SHOW_OPTIONS so there is live state to save:
    // a pending option list, stack contents, variables, and a clock.
    let prog = program(vec![node(
        "Start",
        vec![
            push_f(20.0),
            push_f(1.0),
            call("dice"),
            store("$roll"),
            add_option("line:a", "a"),
            show_options(),
            jump(),
            stop(),
        ],
        &[("a", 7)],
    )]);

    let path = temp_file("program");
    std::fs::write(&path, prog.encode_to_vec()).unwrap();
    let path_str = path.to_string_lossy().to_string();

    let settings = VmSettings { random_seed: 9, ..VmSettings::default() };
    let mut vm = YarnVm::new(settings);
    vm.load_program(&path_str).unwrap();
    let mut recorder = Recorder::default();
    vm.load_node("Start", &mut recorder).unwrap();
    vm.set_time(250);
    run_until_blocked(&mut vm, &mut recorder);
    assert_eq!(vm.state(), RunningState::AwaitingInput);

    let save = vm.to_save().unwrap();
    let text = serde_json::to_string(&save).unwrap();
    let reloaded = serde_json::from_str(&text).unwrap();

    let mut restored_recorder = Recorder::default();
    let mut restored = YarnVm::from_save(&reloaded, &mut restored_recorder).unwrap();

    // One node change, and the pending options were re-presented.
    assert_eq!(restored_recorder.node_changes.len(), 1);
    assert_eq!(restored_recorder.options.len(), 1);
    assert_eq!(restored_recorder.options[0], recorder.options[0]);

    assert_eq!(restored.state(), RunningState::AwaitingInput);
    assert_eq!(restored.instruction_pointer(), vm.instruction_pointer());
    assert_eq!(restored.stack(), vm.stack());
    assert_eq!(restored.variable("$roll"), vm.variable("$roll"));
    assert_eq!(restored.time(), 250);

    // Identical behavior after restore: same selection, same result.
    vm.select_option(0).unwrap();
    restored.select_option(0).unwrap();
    run_until_blocked(&mut vm, &mut recorder);
    run_until_blocked(&mut restored, &mut restored_recorder);
    assert_eq!(restored.instruction_pointer(), vm.instruction_pointer());
    assert_eq!(restored.to_save().unwrap(), vm.to_save().unwrap());

    let _ = std::fs::remove_file(&path);
}
