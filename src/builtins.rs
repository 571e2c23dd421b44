// File: src/builtins.rs
//
// The builtin function library available to compiled scripts.
// Every entry follows the calling convention of CALL_FUNC: the callee
// pops its arguments from the VM stack (topmost argument last) and
// returns a single value for the VM to push. Registered names are fixed
// by the dialogue compiler.

use crate::errors::DialogueError;
use crate::value::Value;
use crate::vm::{YarnFunction, YarnVm};
use ahash::AHashMap;
use std::rc::Rc;

fn check_arity(name: &str, expected: usize, got: usize) -> Result<(), DialogueError> {
    if got != expected {
        return Err(DialogueError::runtime(format!(
            "{} expects {} arguments, got {}",
            name, expected, got
        )));
    }
    Ok(())
}

/// Binary numeric operator. The right operand is popped first, so
/// non-commutative operations see their arguments in source order.
fn number_binary(name: &'static str, apply: fn(f32, f32) -> Value) -> YarnFunction {
    Rc::new(move |vm, parameters| {
        check_arity(name, 2, parameters)?;
        let b = vm.pop_number()?;
        let a = vm.pop_number()?;
        Ok(apply(a, b))
    })
}

fn number_unary(name: &'static str, apply: fn(f32) -> f32) -> YarnFunction {
    Rc::new(move |vm, parameters| {
        check_arity(name, 1, parameters)?;
        let n = vm.pop_number()?;
        Ok(Value::Number(apply(n)))
    })
}

fn bool_binary(name: &'static str, apply: fn(bool, bool) -> bool) -> YarnFunction {
    Rc::new(move |vm, parameters| {
        check_arity(name, 2, parameters)?;
        let b = vm.pop_bool()?;
        let a = vm.pop_bool()?;
        Ok(Value::Bool(apply(a, b)))
    })
}

/// Build the standard function table registered into every new VM.
pub fn standard_library() -> AHashMap<String, YarnFunction> {
    let mut functions: AHashMap<String, YarnFunction> = AHashMap::new();
    let mut register = |name: &str, func: YarnFunction| {
        functions.insert(name.to_string(), func);
    };

    // Arithmetic
    register("Number.Add", number_binary("Number.Add", |a, b| Value::Number(a + b)));
    register("Number.Minus", number_binary("Number.Minus", |a, b| Value::Number(a - b)));
    register("Number.Multiply", number_binary("Number.Multiply", |a, b| Value::Number(a * b)));
    register("Number.Divide", number_binary("Number.Divide", |a, b| Value::Number(a / b)));
    register("Number.Modulo", number_binary("Number.Modulo", |a, b| Value::Number(a % b)));

    // Comparison
    register("Number.EqualTo", number_binary("Number.EqualTo", |a, b| Value::Bool(a == b)));
    register("Number.LessThan", number_binary("Number.LessThan", |a, b| Value::Bool(a < b)));
    register("Number.GreaterThan", number_binary("Number.GreaterThan", |a, b| Value::Bool(a > b)));
    register(
        "Number.LessThanOrEqualTo",
        number_binary("Number.LessThanOrEqualTo", |a, b| Value::Bool(a <= b)),
    );
    register(
        "Number.GreaterThanOrEqualTo",
        number_binary("Number.GreaterThanOrEqualTo", |a, b| Value::Bool(a >= b)),
    );

    // Logic
    register("Bool.And", bool_binary("Bool.And", |a, b| a && b));
    register("Bool.Or", bool_binary("Bool.Or", |a, b| a || b));
    register("Bool.Xor", bool_binary("Bool.Xor", |a, b| a != b));
    register(
        "Bool.Not",
        Rc::new(|vm, parameters| {
            check_arity("Bool.Not", 1, parameters)?;
            let a = vm.pop_bool()?;
            Ok(Value::Bool(!a))
        }),
    );

    // visited(node_name) is true once a node has been entered and exited
    // at least once. Unknown node names read as never visited.
    register(
        "visited",
        Rc::new(|vm, parameters| {
            check_arity("visited", 1, parameters)?;
            let node = vm.pop_string()?;
            Ok(Value::Bool(vm.visited_count(&node) > 0))
        }),
    );

    // visited_count(node_name) is the number of completed entry/exit
    // cycles through the node.
    register(
        "visited_count",
        Rc::new(|vm, parameters| {
            check_arity("visited_count", 1, parameters)?;
            let node = vm.pop_string()?;
            Ok(Value::Number(vm.visited_count(&node) as f32))
        }),
    );

    // random() in [0, 1)
    register(
        "random",
        Rc::new(|vm, parameters| {
            check_arity("random", 0, parameters)?;
            let n = vm.rng.next_f32();
            Ok(Value::Number(n))
        }),
    );

    // random_range(a, b): integer in [a, b] inclusive
    register(
        "random_range",
        Rc::new(|vm, parameters| {
            check_arity("random_range", 2, parameters)?;
            let b = vm.pop_number()?;
            let a = vm.pop_number()?;
            if a > b {
                return Err(DialogueError::runtime(format!(
                    "random_range requires a <= b, got {} and {}",
                    a, b
                )));
            }
            let n = vm.rng.int_in_range(a as i64, b as i64);
            Ok(Value::Number(n as f32))
        }),
    );

    // dice(sides): integer in [1, sides] inclusive
    register(
        "dice",
        Rc::new(|vm, parameters| {
            check_arity("dice", 1, parameters)?;
            let sides = vm.pop_number()?;
            if sides < 1.0 {
                return Err(DialogueError::runtime(format!(
                    "dice requires at least one side, got {}",
                    sides
                )));
            }
            let n = vm.rng.int_in_range(1, sides as i64);
            Ok(Value::Number(n as f32))
        }),
    );

    // Rounding and numeric utilities
    register("round", number_unary("round", |n| n.round()));
    register("floor", number_unary("floor", |n| n.floor()));
    register("ceil", number_unary("ceil", |n| n.ceil()));
    register("int", number_unary("int", |n| n.trunc()));

    // round_places(n, places): round to `places` decimal points
    register(
        "round_places",
        Rc::new(|vm, parameters| {
            check_arity("round_places", 2, parameters)?;
            let places = vm.pop_number()?;
            let n = vm.pop_number()?;
            let scale = 10f32.powi(places as i32);
            Ok(Value::Number((n * scale).round() / scale))
        }),
    );

    // inc(n): next integer above n, or n+1 when n is already integral
    register(
        "inc",
        number_unary("inc", |n| {
            let up = n.ceil();
            if up == n {
                up + 1.0
            } else {
                up
            }
        }),
    );

    // dec(n): next integer below n, or n-1 when n is already integral
    register(
        "dec",
        number_unary("dec", |n| {
            let down = n.floor();
            if down == n {
                down - 1.0
            } else {
                down
            }
        }),
    );

    // decimal(n): fractional part of n, keeping n's sign
    register("decimal", number_unary("decimal", |n| n - n.trunc()));

    functions
}
