// File: src/runner.rs
//
// The dialogue driver: glue between the VM and the host application.
// The runner pumps instructions, resolves line ids against the line
// database, expands substitutions, walks line markup invoking per-name
// callbacks, dispatches script commands through a bindable command
// table, and hands plain-text fragments and option prompts to the host.
//
// VM callbacks are buffered during each instruction and applied
// afterwards, so command handlers and option selection get full mutable
// access to the VM without re-entering the dispatcher.

use crate::errors::DialogueError;
use crate::line_database::LineDatabase;
use crate::markup::{AttribType, Attribute, LineAttributes};
use crate::markup::{cardinal_plural_class, ordinal_plural_class};
use crate::substitution;
use crate::vm::{DialogueCallbacks, DialogueOption, Line, RunningState, VmSettings, YarnVm};
use ahash::AHashMap;
use serde_json::json;
use std::fs;
use std::path::Path;

/// Registered name of the distinguished close-all markup callback. A
/// handler bound under this name runs whenever a `[/]` attribute is
/// processed, so stateful handlers can reset themselves.
pub const CLOSE_ALL_MARKUP: &str = "close_all";

/// Markup names that replace their span with chosen text and therefore
/// keep the whitespace that follows them.
const NO_TRIM_MARKUP: [&str; 3] = ["select", "plural", "ordinal"];

/// A markup handler: writes replacement text for an attribute into the
/// output buffer. The full source line and the parsed attribute are
/// provided for context.
pub type MarkupCallback =
    Box<dyn FnMut(&mut String, &str, &Attribute) -> Result<(), DialogueError>>;

/// A script command handler. Receives the VM and the whitespace-split
/// arguments after the command name.
pub type CommandHandler = Box<dyn FnMut(&mut YarnVm, &[&str]) -> Result<(), DialogueError>>;

/// Driver-level behavior switches.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Skip markup processing entirely and hand lines over verbatim.
    pub ignore_all_markup: bool,
    /// Emit unrecognized markup as literal source text instead of
    /// dropping it.
    pub emit_unhandled_markup: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self { ignore_all_markup: false, emit_unhandled_markup: true }
    }
}

/// An option rendered for presentation: the line text has already been
/// through substitution and markup.
#[derive(Debug, Clone)]
pub struct PresentedOption {
    /// Index to pass back to `select_option`.
    pub index: usize,
    pub text: String,
    pub enabled: bool,
}

/// Host-side presentation interface for a dialogue session.
pub trait DialogueHost {
    /// A plain-text fragment of the current line.
    fn on_text(&mut self, text: &str);

    /// The current line is complete.
    fn on_line_end(&mut self) {}

    /// Present options to the player. Return `Some(index)` to select
    /// immediately; return `None` to leave the dialogue awaiting input
    /// and select later through `YarnRunner::select_option`.
    fn on_options(&mut self, options: &[PresentedOption]) -> Option<usize>;

    /// A script command no bound handler claimed.
    fn on_unknown_command(&mut self, _command: &str) {}

    fn on_node_changed(&mut self, _from: Option<&str>, _to: &str) {}

    fn on_dialogue_end(&mut self) {}
}

/// Buffers VM callbacks raised during one instruction so the runner can
/// act on them with the VM borrow released.
#[derive(Default)]
struct EventQueue {
    events: Vec<VmEvent>,
}

enum VmEvent {
    Line(Line),
    Command(String),
    Options(Vec<DialogueOption>),
    NodeChanged { from: Option<String>, to: String },
    Stopped,
}

impl DialogueCallbacks for EventQueue {
    fn on_line(&mut self, line: &Line) {
        self.events.push(VmEvent::Line(line.clone()));
    }

    fn on_command(&mut self, command: &str) {
        self.events.push(VmEvent::Command(command.to_string()));
    }

    fn on_options(&mut self, options: &[DialogueOption]) {
        self.events.push(VmEvent::Options(options.to_vec()));
    }

    fn on_node_changed(&mut self, from: Option<&str>, to: &str) {
        self.events.push(VmEvent::NodeChanged {
            from: from.map(str::to_string),
            to: to.to_string(),
        });
    }

    fn on_stopped(&mut self) {
        self.events.push(VmEvent::Stopped);
    }
}

/// The dialogue driver.
pub struct YarnRunner {
    pub vm: YarnVm,
    pub db: LineDatabase,
    pub settings: RunnerSettings,
    markup_callbacks: AHashMap<String, MarkupCallback>,
    commands: AHashMap<String, CommandHandler>,
    module_name: String,
}

impl YarnRunner {
    pub fn new(vm_settings: VmSettings) -> YarnRunner {
        let mut runner = YarnRunner {
            vm: YarnVm::new(vm_settings),
            db: LineDatabase::new(),
            settings: RunnerSettings::default(),
            markup_callbacks: AHashMap::new(),
            commands: AHashMap::new(),
            module_name: String::new(),
        };
        runner.set_builtin_markup_callbacks();
        runner.set_builtin_commands();
        runner
    }

    /// Bind a markup handler for an attribute name. Handlers registered
    /// under `CLOSE_ALL_MARKUP` run on every `[/]`.
    pub fn set_markup_callback<F>(&mut self, name: impl Into<String>, callback: F)
    where
        F: FnMut(&mut String, &str, &Attribute) -> Result<(), DialogueError> + 'static,
    {
        self.markup_callbacks.insert(name.into(), Box::new(callback));
    }

    /// Bind a script command handler.
    pub fn bind_command<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: FnMut(&mut YarnVm, &[&str]) -> Result<(), DialogueError> + 'static,
    {
        self.commands.insert(name.into(), Box::new(handler));
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Load a module's program and line data, then start at the given
    /// node. Expects `<module>.yarnc`, `<module>-Lines.csv` and
    /// `<module>-Metadata.csv` alongside each other.
    pub fn load_module(
        &mut self,
        module: &str,
        start_node: &str,
        host: &mut dyn DialogueHost,
    ) -> Result<(), DialogueError> {
        self.module_name = module.to_string();
        self.load_module_line_db(module)?;
        self.vm.load_program(&format!("{}.yarnc", module))?;

        let mut queue = EventQueue::default();
        self.vm.load_node(start_node, &mut queue)?;
        self.drain(queue, host)
    }

    fn load_module_line_db(&mut self, module: &str) -> Result<(), DialogueError> {
        self.db.load(
            format!("{}-Lines.csv", module),
            format!("{}-Metadata.csv", module),
        )
    }

    /// Run until the VM stops being runnable: an option prompt the host
    /// deferred, a sleep, a stop, or an error in strict mode.
    pub fn continue_dialogue(&mut self, host: &mut dyn DialogueHost) -> Result<(), DialogueError> {
        while self.vm.state() == RunningState::Running {
            self.step(host)?;
        }
        Ok(())
    }

    /// Execute one instruction and deliver everything it produced.
    pub fn step(&mut self, host: &mut dyn DialogueHost) -> Result<(), DialogueError> {
        let instruction = self.vm.current_instruction()?.clone();
        let mut queue = EventQueue::default();
        let result = self.vm.process_instruction(&instruction, &mut queue);
        self.drain(queue, host)?;
        result
    }

    /// Forward a player's option choice to the VM.
    pub fn select_option(&mut self, selection: usize) -> Result<(), DialogueError> {
        self.vm.select_option(selection)
    }

    fn drain(&mut self, queue: EventQueue, host: &mut dyn DialogueHost) -> Result<(), DialogueError> {
        for event in queue.events {
            if let Err(err) = self.handle_event(event, host) {
                self.recover(err)?;
            }
        }
        Ok(())
    }

    fn handle_event(
        &mut self,
        event: VmEvent,
        host: &mut dyn DialogueHost,
    ) -> Result<(), DialogueError> {
        match event {
            VmEvent::Line(line) => {
                self.run_line(&line, host)?;
                host.on_line_end();
            }

            VmEvent::Command(command) => self.dispatch_command(&command, host)?,

            VmEvent::Options(options) => {
                let mut presented = Vec::with_capacity(options.len());
                for (index, option) in options.iter().enumerate() {
                    let text = self.render_line(&option.line)?;
                    presented.push(PresentedOption { index, text, enabled: option.enabled });
                }

                if let Some(selection) = host.on_options(&presented) {
                    self.vm.select_option(selection)?;
                }
            }

            VmEvent::NodeChanged { from, to } => host.on_node_changed(from.as_deref(), &to),

            VmEvent::Stopped => host.on_dialogue_end(),
        }
        Ok(())
    }

    /// Resolve, substitute, and markup-process a line, streaming the
    /// resulting fragments to the host.
    fn run_line(&mut self, line: &Line, host: &mut dyn DialogueHost) -> Result<(), DialogueError> {
        let text = self.resolve_line_text(line)?;

        if self.settings.ignore_all_markup {
            host.on_text(&text);
            return Ok(());
        }

        let attribs = LineAttributes::parse(&text);
        self.process_line(&text, &attribs, &mut |fragment| host.on_text(fragment))
    }

    /// Render a line to a single string. Used for option presentation.
    fn render_line(&mut self, line: &Line) -> Result<String, DialogueError> {
        let text = self.resolve_line_text(line)?;

        if self.settings.ignore_all_markup {
            return Ok(text);
        }

        let attribs = LineAttributes::parse(&text);
        let mut rendered = String::with_capacity(text.len());
        self.process_line(&text, &attribs, &mut |fragment| rendered.push_str(fragment))?;
        Ok(rendered)
    }

    fn resolve_line_text(&self, line: &Line) -> Result<String, DialogueError> {
        let record = self.db.line(&line.id).ok_or_else(|| {
            DialogueError::malformed(format!("line id not in database: {}", line.id))
        })?;

        if line.substitutions.is_empty() {
            Ok(record.text.clone())
        } else {
            Ok(substitution::expand(&record.text, &line.substitutions))
        }
    }

    /// Walk the parsed attributes over the line, emitting plain-text runs
    /// and handing each attribute to its callback.
    fn process_line(
        &mut self,
        line: &str,
        attribs: &LineAttributes,
        sink: &mut dyn FnMut(&str),
    ) -> Result<(), DialogueError> {
        let mut cursor = 0usize;
        // One pending whitespace byte to drop from the next plain run,
        // owed by a self-closing attribute behind us.
        let mut trim_pending = false;
        let mut nomarkup = false;

        for attr in &attribs.attribs {
            if attr.position > cursor {
                emit_run(&line[cursor..attr.position], trim_pending, sink);
                trim_pending = false;
            }

            match attr.kind {
                AttribType::CloseAll => {
                    nomarkup = false;
                    if let Some(callback) = self.markup_callbacks.get_mut(CLOSE_ALL_MARKUP) {
                        let mut replacement = String::new();
                        callback(&mut replacement, line, attr)?;
                        if !replacement.is_empty() {
                            sink(&replacement);
                        }
                    }
                }
                _ if attr.name == "nomarkup" => {
                    // The region toggles; the tags themselves don't render.
                    nomarkup = attr.kind == AttribType::Open;
                }
                _ if nomarkup => {
                    sink(&line[attr.position..attr.position + attr.length]);
                }
                _ => match self.markup_callbacks.get_mut(&attr.name) {
                    Some(callback) => {
                        let mut replacement = String::new();
                        callback(&mut replacement, line, attr)?;
                        if !replacement.is_empty() {
                            sink(&replacement);
                        }
                    }
                    None if self.settings.emit_unhandled_markup => {
                        sink(&line[attr.position..attr.position + attr.length]);
                    }
                    None => {}
                },
            }

            trim_pending = trims_following_whitespace(line, attr);
            cursor = attr.position + attr.length;
        }

        if cursor < line.len() {
            emit_run(&line[cursor..], trim_pending, sink);
        }

        Ok(())
    }

    fn dispatch_command(
        &mut self,
        command: &str,
        host: &mut dyn DialogueHost,
    ) -> Result<(), DialogueError> {
        let mut words = command.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(());
        };
        let args: Vec<&str> = words.collect();

        if let Some(handler) = self.commands.get_mut(name) {
            handler(&mut self.vm, &args)
        } else {
            host.on_unknown_command(command);
            Ok(())
        }
    }

    /// Write the dialogue state to a save file: the VM snapshot wrapped
    /// with the module name so restore can reload the line database.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DialogueError> {
        let document = json!({
            "moduleName": self.module_name,
            "vm": self.vm.to_save()?,
        });
        fs::write(path.as_ref(), serde_json::to_string_pretty(&document)?)?;
        Ok(())
    }

    /// Restore dialogue state from a save file. The restored node change
    /// and any pending option prompt are delivered to the host.
    pub fn restore(
        &mut self,
        path: impl AsRef<Path>,
        host: &mut dyn DialogueHost,
    ) -> Result<(), DialogueError> {
        let text = fs::read_to_string(path.as_ref())?;
        let document: serde_json::Value = serde_json::from_str(&text)?;

        let module = document["moduleName"]
            .as_str()
            .ok_or_else(|| DialogueError::io("save file is missing moduleName"))?
            .to_string();
        let save = serde_json::from_value(document["vm"].clone())?;

        self.module_name = module.clone();
        self.db = LineDatabase::new();
        self.load_module_line_db(&module)?;

        let mut queue = EventQueue::default();
        self.vm = YarnVm::from_save(&save, &mut queue)?;
        self.drain(queue, host)
    }

    /// Strict mode surfaces driver-level failures; lax mode logs them and
    /// keeps the dialogue moving.
    fn recover(&mut self, err: DialogueError) -> Result<(), DialogueError> {
        if self.vm.settings().enable_exceptions {
            Err(err)
        } else {
            err.warn();
            Ok(())
        }
    }

    fn set_builtin_markup_callbacks(&mut self) {
        // select: pick the property named by `value`, with `other` as the
        // fallback. `%` inside the chosen text echoes the value itself.
        self.set_markup_callback("select", |out: &mut String, _line: &str, attr: &Attribute| {
            let value = require_value(attr)?;
            let chosen = attr.property(value).or_else(|| attr.property("other")).ok_or_else(
                || {
                    DialogueError::runtime(format!(
                        "cannot resolve select markup for value {}",
                        value
                    ))
                },
            )?;
            replace_marker(out, chosen, value);
            Ok(())
        });

        // plural: pick by the cardinal plural class of `value`.
        self.set_markup_callback("plural", |out: &mut String, _line: &str, attr: &Attribute| {
            let value = require_value(attr)?;
            let class = cardinal_plural_class(value);
            let chosen = attr.property(class).or_else(|| attr.property("other")).ok_or_else(
                || {
                    DialogueError::runtime(format!(
                        "cannot resolve plural markup for value {}",
                        value
                    ))
                },
            )?;
            replace_marker(out, chosen, value);
            Ok(())
        });

        // ordinal: pick by the ordinal plural class of `value`.
        self.set_markup_callback("ordinal", |out: &mut String, _line: &str, attr: &Attribute| {
            let value = require_value(attr)?;
            let class = ordinal_plural_class(value);
            let chosen = attr.property(class).or_else(|| attr.property("other")).ok_or_else(
                || {
                    DialogueError::runtime(format!(
                        "cannot resolve ordinal markup for value {}",
                        value
                    ))
                },
            )?;
            replace_marker(out, chosen, value);
            Ok(())
        });
    }

    fn set_builtin_commands(&mut self) {
        // The wait command is part of the script vocabulary; stop is
        // compiled away into a STOP instruction and needs no handler.
        self.bind_command("wait", |vm: &mut YarnVm, args: &[&str]| {
            let duration = args
                .first()
                .ok_or_else(|| DialogueError::runtime("wait requires a duration"))?
                .parse::<i64>()
                .map_err(|_| DialogueError::runtime("wait duration must be an integer"))?;
            vm.set_wait_time(duration)
        });
    }
}

/// Emit one plain-text run, honoring a single pending whitespace trim.
fn emit_run(run: &str, trim_leading_whitespace: bool, sink: &mut dyn FnMut(&str)) {
    let run = if trim_leading_whitespace && run.as_bytes().first().is_some_and(u8::is_ascii_whitespace)
    {
        &run[1..]
    } else {
        run
    };

    if !run.is_empty() {
        sink(run);
    }
}

/// Whether this attribute consumes one whitespace byte after its span: a
/// self-closing attribute at the start of the line or right after
/// whitespace does, unless overridden by `trimwhitespace=false`. The
/// text-producing select/plural/ordinal attributes never trim.
fn trims_following_whitespace(line: &str, attr: &Attribute) -> bool {
    if attr.kind != AttribType::SelfClosing {
        return false;
    }
    if NO_TRIM_MARKUP.contains(&attr.name.as_str()) {
        return false;
    }
    if attr.property("trimwhitespace") == Some("false") {
        return false;
    }

    attr.position == 0
        || line[..attr.position]
            .as_bytes()
            .last()
            .is_some_and(u8::is_ascii_whitespace)
}

fn require_value(attr: &Attribute) -> Result<&str, DialogueError> {
    attr.property("value").ok_or_else(|| {
        DialogueError::runtime(format!("{} markup is missing its value property", attr.name))
    })
}

/// Copy `text` into `out`, replacing each `%` with `value`.
fn replace_marker(out: &mut String, text: &str, value: &str) {
    for ch in text.chars() {
        if ch == '%' {
            out.push_str(value);
        } else {
            out.push(ch);
        }
    }
}
