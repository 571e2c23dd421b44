// File: src/save.rs
//
// Snapshot and restore of complete VM state.
// A save blob carries everything needed to resume a dialogue exactly
// where it left off: settings, generator state, variables, stack,
// pending options, position, running state, and the clock. The compiled
// program itself is not embedded; the blob stores its path and restore
// re-opens it.

use crate::errors::DialogueError;
use crate::rng::DialogueRng;
use crate::value::Value;
use crate::vm::{DialogueCallbacks, DialogueOption, RunningState, VmSettings, YarnVm};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The serializable snapshot of a VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveState {
    pub settings: VmSettings,
    /// Textual generator state; restoring it resumes the random sequence.
    pub generator: String,
    pub variables: HashMap<String, Value>,
    /// Operand stack, bottom to top.
    pub stack: Vec<Value>,
    pub options: Vec<DialogueOption>,
    pub current_node: String,
    pub instruction_pointer: u32,
    pub running_state: u32,
    pub time: i64,
    pub wait_until_time: i64,
    pub yarnc_file: String,
}

impl YarnVm {
    /// Snapshot the VM. Requires a loaded node; a VM that never started
    /// has nothing meaningful to resume.
    pub fn to_save(&self) -> Result<SaveState, DialogueError> {
        let current_node = self
            .current_node
            .clone()
            .ok_or_else(|| DialogueError::runtime("cannot save before a node is loaded"))?;

        Ok(SaveState {
            settings: self.settings.clone(),
            generator: self.rng.state_string()?,
            variables: self.variables.clone(),
            stack: self.stack.clone(),
            options: self.options.clone(),
            current_node,
            instruction_pointer: self.instruction_pointer as u32,
            running_state: self.running_state.as_u32(),
            time: self.time,
            wait_until_time: self.wait_until_time,
            yarnc_file: self.program_path.clone(),
        })
    }

    /// Reconstitute a VM from a snapshot.
    ///
    /// The program is re-opened from its stored path, the saved node is
    /// loaded (firing the node-change hook once), and the execution state
    /// is overwritten from the snapshot. A VM restored into the
    /// awaiting-input state re-presents its options so the host can
    /// prompt again.
    pub fn from_save(
        save: &SaveState,
        callbacks: &mut dyn DialogueCallbacks,
    ) -> Result<YarnVm, DialogueError> {
        let mut vm = YarnVm::new(save.settings.clone());
        vm.rng = DialogueRng::from_state_string(&save.generator)?;
        vm.time = save.time;
        vm.wait_until_time = save.wait_until_time;

        vm.load_program(&save.yarnc_file)?;
        vm.load_node(&save.current_node, callbacks)?;

        vm.variables = save.variables.clone();
        vm.stack = save.stack.clone();
        vm.options = save.options.clone();
        vm.set_instruction(save.instruction_pointer as usize)?;
        vm.running_state = RunningState::from_u32(save.running_state)?;

        if vm.running_state == RunningState::AwaitingInput {
            callbacks.on_options(&vm.options);
        }

        Ok(vm)
    }
}
