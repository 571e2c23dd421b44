// File: src/vm.rs
//
// Virtual machine for executing compiled dialogue bytecode.
// Stack-based VM driven cooperatively by a host: the host pumps
// instructions while the VM is running, answers option prompts while it
// awaits input, and advances the clock while it sleeps. Events surface
// through the DialogueCallbacks trait; the function table provides the
// script-visible builtin library plus any host-registered functions.

use crate::builtins;
use crate::bytecode::{Instruction, Node, OpCode, Program};
use crate::errors::DialogueError;
use crate::rng::DialogueRng;
use crate::value::Value;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::rc::Rc;

/// Prefix of the reserved variables that track node entry/exit counts.
/// The counters are written by compiler-emitted instructions; the VM only
/// reads them back for the visited builtins.
const VISIT_TRACKER_PREFIX: &str = "$Yarn.Internal.Visiting.";

/// A script-callable function. The callee pops exactly `parameters`
/// arguments from the stack (topmost last) and returns one value, which
/// the VM pushes.
pub type YarnFunction = Rc<dyn Fn(&mut YarnVm, usize) -> Result<Value, DialogueError>>;

/// Settings fixed at VM construction. They ride along in save files so a
/// restored VM behaves identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSettings {
    pub random_seed: u64,
    /// Strict mode: failures surface as errors and stop the program.
    /// Lax mode: failures are logged, the offending instruction is
    /// skipped, and execution continues best-effort.
    pub enable_exceptions: bool,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self { random_seed: 0, enable_exceptions: true }
    }
}

/// A line to present: the id resolves against the line database, and the
/// substitutions splice into `{k}` placeholders in its text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub id: String,
    pub substitutions: Vec<Value>,
}

/// A selectable dialogue choice accumulated between ADD_OPTION
/// instructions and presented by SHOW_OPTIONS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueOption {
    pub line: Line,
    /// Label within the current node to jump to when selected.
    pub destination: String,
    /// False when the option's compiled condition evaluated false; the
    /// host decides how to render unavailable choices.
    pub enabled: bool,
}

/// Current state of the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningState {
    Running,
    Stopped,
    AwaitingInput,
    Asleep,
}

impl RunningState {
    /// Stable integer encoding used by save files.
    pub fn as_u32(self) -> u32 {
        match self {
            RunningState::Running => 0,
            RunningState::Stopped => 1,
            RunningState::AwaitingInput => 2,
            RunningState::Asleep => 3,
        }
    }

    pub fn from_u32(value: u32) -> Result<RunningState, DialogueError> {
        match value {
            0 => Ok(RunningState::Running),
            1 => Ok(RunningState::Stopped),
            2 => Ok(RunningState::AwaitingInput),
            3 => Ok(RunningState::Asleep),
            other => Err(DialogueError::io(format!("unknown running state {}", other))),
        }
    }
}

/// Host-implemented event sink for the VM.
///
/// One object implements the whole set. Handlers run while the VM is
/// mid-dispatch and therefore cannot call back into it; effects that need
/// the VM (selecting an option, starting a wait) are applied by the
/// driver after the instruction completes.
pub trait DialogueCallbacks {
    fn on_line(&mut self, line: &Line);
    fn on_command(&mut self, command: &str);
    fn on_options(&mut self, options: &[DialogueOption]);

    fn on_node_changed(&mut self, _from: Option<&str>, _to: &str) {}
    fn on_stopped(&mut self) {}
}

/// The dialogue virtual machine.
pub struct YarnVm {
    // Serializable execution state
    pub(crate) options: Vec<DialogueOption>,
    pub(crate) stack: Vec<Value>,
    pub(crate) variables: HashMap<String, Value>,
    pub(crate) rng: DialogueRng,
    pub(crate) instruction_pointer: usize,
    pub(crate) running_state: RunningState,
    pub(crate) settings: VmSettings,
    pub(crate) time: i64,
    pub(crate) wait_until_time: i64,
    pub(crate) program_path: String,

    // Derived from the serializable state
    pub(crate) current_node: Option<String>,

    // Not serialized: the program reloads from its path, and function
    // tables are re-registered by the host
    pub(crate) program: Program,
    pub(crate) functions: AHashMap<String, YarnFunction>,
}

impl YarnVm {
    pub fn new(settings: VmSettings) -> YarnVm {
        YarnVm {
            options: Vec::new(),
            stack: Vec::new(),
            variables: HashMap::new(),
            rng: DialogueRng::seeded(settings.random_seed),
            instruction_pointer: 0,
            running_state: RunningState::Stopped,
            time: 0,
            wait_until_time: 0,
            program_path: String::new(),
            current_node: None,
            program: Program::default(),
            functions: builtins::standard_library(),
            settings,
        }
    }

    /// Load a compiled program file and seed the variable store from its
    /// initial values.
    pub fn load_program(&mut self, path: &str) -> Result<(), DialogueError> {
        let program = Program::open(path)?;
        self.install_program(program);
        self.program_path = path.to_string();
        Ok(())
    }

    /// Install an already decoded program, seeding the variable store
    /// from its initial values. Hosts that manage compiled assets
    /// themselves can use this instead of `load_program`; such a VM has
    /// no program path, so its snapshots cannot be restored from disk.
    pub fn install_program(&mut self, program: Program) {
        self.variables = program
            .initial_values
            .iter()
            .map(|(name, operand)| (name.clone(), operand.to_value()))
            .collect();
        self.program = program;
        self.program_path = String::new();
    }

    /// Switch execution to the named node: the instruction pointer resets
    /// to zero, the VM starts running, and the node-change hook fires
    /// before any instruction of the new node executes.
    ///
    /// Returns false in lax mode when the node does not exist.
    pub fn load_node(
        &mut self,
        node: &str,
        callbacks: &mut dyn DialogueCallbacks,
    ) -> Result<bool, DialogueError> {
        if !self.program.nodes.contains_key(node) {
            self.fail(DialogueError::malformed(format!("node not found: {}", node)))?;
            return Ok(false);
        }

        let previous = self.current_node.take();
        self.current_node = Some(node.to_string());
        self.instruction_pointer = 0;
        self.running_state = RunningState::Running;

        callbacks.on_node_changed(previous.as_deref(), node);

        Ok(true)
    }

    pub fn state(&self) -> RunningState {
        self.running_state
    }

    pub fn current_node(&self) -> Option<&str> {
        self.current_node.as_deref()
    }

    pub fn instruction_pointer(&self) -> usize {
        self.instruction_pointer
    }

    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn wait_until_time(&self) -> i64 {
        self.wait_until_time
    }

    pub fn settings(&self) -> &VmSettings {
        &self.settings
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn options(&self) -> &[DialogueOption] {
        &self.options
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// How many times a node has been entered and exited during
    /// execution. Zero when the tracking variable is absent.
    pub fn visited_count(&self, node: &str) -> u32 {
        let tracker = format!("{}{}", VISIT_TRACKER_PREFIX, node);
        self.variables
            .get(&tracker)
            .and_then(Value::as_number)
            .map(|count| count as u32)
            .unwrap_or(0)
    }

    /// Register a script-callable function under the given name.
    pub fn register_function<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(&mut YarnVm, usize) -> Result<Value, DialogueError> + 'static,
    {
        self.functions.insert(name.into(), Rc::new(func));
    }

    /// Advance the clock. Waking from sleep happens here: the VM resumes
    /// once the clock reaches the wake time.
    pub fn set_time(&mut self, time: i64) {
        self.time = time;

        if self.running_state == RunningState::Asleep && self.time >= self.wait_until_time {
            self.running_state = RunningState::Running;
        }
    }

    pub fn increment_time(&mut self, dt: i64) {
        self.set_time(self.time + dt);
    }

    /// Sleep until the clock reaches `time`.
    pub fn wait_until(&mut self, time: i64) {
        self.wait_until_time = time;
        self.running_state = RunningState::Asleep;
    }

    /// Sleep for `dt` clock units from now. Units are whatever the host
    /// feeds to set_time; the VM only compares magnitudes.
    pub fn set_wait_time(&mut self, dt: i64) -> Result<(), DialogueError> {
        if self.running_state == RunningState::Stopped {
            return self.fail(DialogueError::host_input("cannot wait while stopped"));
        }
        self.wait_until(self.time + dt);
        Ok(())
    }

    /// Resolve a pending option choice: the option list clears, the
    /// destination label is pushed for the following JUMP to consume, and
    /// execution resumes.
    pub fn select_option(&mut self, selection: usize) -> Result<(), DialogueError> {
        if self.running_state != RunningState::AwaitingInput {
            return self.fail(DialogueError::host_input("no option selection is pending"));
        }

        let Some(option) = self.options.get(selection) else {
            return self.fail(DialogueError::host_input(format!(
                "invalid option selected: {}",
                selection
            )));
        };

        self.stack.push(Value::String(option.destination.clone()));
        self.options.clear();
        self.running_state = RunningState::Running;

        Ok(())
    }

    /// The instruction the pointer currently rests on.
    pub fn current_instruction(&self) -> Result<&Instruction, DialogueError> {
        let node = self.node()?;
        node.instructions.get(self.instruction_pointer).ok_or_else(|| {
            DialogueError::runtime(format!(
                "instruction pointer {} is outside node {}",
                self.instruction_pointer, node.name
            ))
        })
    }

    /// Execute one instruction.
    ///
    /// In strict mode a failure stops the program, fires the stopped hook,
    /// and returns the error. In lax mode the failure is logged, the
    /// instruction is skipped, and execution continues.
    pub fn process_instruction(
        &mut self,
        instruction: &Instruction,
        callbacks: &mut dyn DialogueCallbacks,
    ) -> Result<(), DialogueError> {
        let was_stopped = self.running_state == RunningState::Stopped;
        let result = if was_stopped {
            Err(DialogueError::runtime("cannot process instructions while stopped"))
        } else {
            self.execute(instruction, callbacks)
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) if self.settings.enable_exceptions => {
                if !was_stopped {
                    self.running_state = RunningState::Stopped;
                    callbacks.on_stopped();
                }
                Err(err)
            }
            Err(err) => {
                err.warn();
                // Best-effort recovery: skip the offending instruction.
                if self.running_state == RunningState::Running && self.advance().is_err() {
                    self.running_state = RunningState::Stopped;
                    callbacks.on_stopped();
                }
                Ok(())
            }
        }
    }

    fn execute(
        &mut self,
        instruction: &Instruction,
        callbacks: &mut dyn DialogueCallbacks,
    ) -> Result<(), DialogueError> {
        if self.current_node.is_none() {
            return Err(DialogueError::runtime("no node is loaded"));
        }

        match instruction.op()? {
            OpCode::JumpTo => {
                let label = instruction.string_operand(0)?;
                let target = self.label_target(label)?;
                self.set_instruction(target)?;
                return Ok(());
            }

            OpCode::Jump => {
                let label = self.pop_string()?;
                let target = self.label_target(&label)?;
                self.set_instruction(target)?;
                return Ok(());
            }

            OpCode::RunLine => {
                let id = instruction.string_operand(0)?.to_string();
                let count = instruction.float_operand(1)? as usize;
                let substitutions = self.pop_substitutions(count)?;
                callbacks.on_line(&Line { id, substitutions });
            }

            OpCode::RunCommand => {
                callbacks.on_command(instruction.string_operand(0)?);
            }

            OpCode::AddOption => {
                let id = instruction.string_operand(0)?.to_string();
                let destination = instruction.string_operand(1)?.to_string();

                let substitutions = if instruction.operands.len() > 2 {
                    let count = instruction.float_operand(2)? as usize;
                    self.pop_substitutions(count)?
                } else {
                    Vec::new()
                };

                let enabled = if instruction.operands.len() > 3 && instruction.bool_operand(3)? {
                    self.pop_bool()?
                } else {
                    true
                };

                self.options.push(DialogueOption {
                    line: Line { id, substitutions },
                    destination,
                    enabled,
                });
            }

            OpCode::ShowOptions => {
                if self.options.is_empty() {
                    return Err(DialogueError::runtime("SHOW_OPTIONS with no pending options"));
                }

                self.running_state = RunningState::AwaitingInput;
                callbacks.on_options(&self.options);
            }

            OpCode::PushString => {
                let value = Value::String(instruction.string_operand(0)?.to_string());
                self.stack.push(value);
            }

            OpCode::PushFloat => {
                let value = Value::Number(instruction.float_operand(0)?);
                self.stack.push(value);
            }

            OpCode::PushBool => {
                let value = Value::Bool(instruction.bool_operand(0)?);
                self.stack.push(value);
            }

            OpCode::PushNull => {
                self.stack.push(Value::Null);
            }

            OpCode::JumpIfFalse => {
                if !self.peek()?.is_truthy() {
                    let label = instruction.string_operand(0)?;
                    let target = self.label_target(label)?;
                    self.set_instruction(target)?;
                    return Ok(());
                }
            }

            OpCode::Pop => {
                self.pop_value()?;
            }

            OpCode::CallFunc => {
                let name = instruction.string_operand(0)?;
                let parameters = self.pop_number()? as usize;

                let Some(func) = self.functions.get(name).cloned() else {
                    return Err(DialogueError::runtime(format!(
                        "missing function with identifier: {}",
                        name
                    )));
                };

                let result = func(self, parameters)?;
                self.stack.push(result);
            }

            OpCode::PushVariable => {
                let name = instruction.string_operand(0)?;
                let value = self.variables.get(name).cloned().unwrap_or(Value::Null);
                self.stack.push(value);
            }

            OpCode::StoreVariable => {
                let name = instruction.string_operand(0)?.to_string();
                let value = self.peek()?.clone();
                self.variables.insert(name, value);
            }

            OpCode::Stop => {
                self.running_state = RunningState::Stopped;
                callbacks.on_stopped();
                return Ok(());
            }

            OpCode::RunNode => {
                let node = self.pop_string()?;
                if self.load_node(&node, callbacks)? {
                    return Ok(());
                }
                // Missing node swallowed in lax mode: fall through and
                // advance past this instruction like any other skipped
                // failure.
            }
        }

        self.advance()
    }

    /// Move the pointer to the next instruction. Fails past the end of
    /// the node or while stopped.
    pub fn advance(&mut self) -> Result<(), DialogueError> {
        if self.running_state == RunningState::Stopped {
            return Err(DialogueError::runtime("cannot advance while stopped"));
        }

        let node = self.node()?;
        if self.instruction_pointer + 1 >= node.instructions.len() {
            return Err(DialogueError::runtime(format!(
                "advanced past the end of node {}",
                node.name
            )));
        }

        self.instruction_pointer += 1;
        Ok(())
    }

    /// Set the pointer to an absolute instruction index within the
    /// current node.
    pub fn set_instruction(&mut self, index: usize) -> Result<(), DialogueError> {
        let node = self.node()?;
        if index >= node.instructions.len() {
            return Err(DialogueError::runtime(format!(
                "instruction index {} is outside node {}",
                index, node.name
            )));
        }

        self.instruction_pointer = index;
        Ok(())
    }

    // --- Stack access for builtin and host functions ---

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop_value(&mut self) -> Result<Value, DialogueError> {
        self.stack.pop().ok_or_else(|| DialogueError::runtime("pop from empty stack"))
    }

    pub fn pop_number(&mut self) -> Result<f32, DialogueError> {
        let value = self.pop_value()?;
        value.as_number().ok_or_else(|| {
            DialogueError::runtime(format!("expected a number on the stack, found {}", value.type_name()))
        })
    }

    pub fn pop_bool(&mut self) -> Result<bool, DialogueError> {
        let value = self.pop_value()?;
        value.as_bool().ok_or_else(|| {
            DialogueError::runtime(format!("expected a bool on the stack, found {}", value.type_name()))
        })
    }

    pub fn pop_string(&mut self) -> Result<String, DialogueError> {
        let value = self.pop_value()?;
        match value {
            Value::String(s) => Ok(s),
            other => Err(DialogueError::runtime(format!(
                "expected a string on the stack, found {}",
                other.type_name()
            ))),
        }
    }

    pub fn peek(&self) -> Result<&Value, DialogueError> {
        self.stack.last().ok_or_else(|| DialogueError::runtime("peek on empty stack"))
    }

    // --- Internal helpers ---

    /// Pop `count` values into a substitution list, most recent first.
    fn pop_substitutions(&mut self, count: usize) -> Result<Vec<Value>, DialogueError> {
        let mut substitutions = Vec::with_capacity(count);
        for _ in 0..count {
            substitutions.push(self.pop_value()?);
        }
        Ok(substitutions)
    }

    fn node(&self) -> Result<&Node, DialogueError> {
        let name = self
            .current_node
            .as_deref()
            .ok_or_else(|| DialogueError::runtime("no node is loaded"))?;
        self.program
            .nodes
            .get(name)
            .ok_or_else(|| DialogueError::runtime(format!("current node {} is gone", name)))
    }

    fn label_target(&self, label: &str) -> Result<usize, DialogueError> {
        self.node()?
            .label(label)
            .ok_or_else(|| DialogueError::runtime(format!("jump to missing label: {}", label)))
    }

    /// Apply the error policy to a failed host call: strict mode returns
    /// the error, lax mode logs it and carries on.
    fn fail(&mut self, err: DialogueError) -> Result<(), DialogueError> {
        if self.settings.enable_exceptions {
            Err(err)
        } else {
            err.warn();
            Ok(())
        }
    }
}
