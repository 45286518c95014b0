// File: src/natives/math.rs
//
// Math native functions. All of these follow the lenient policy:
// an argc or argument-kind mismatch returns nil.

use super::NativeDef;
use crate::errors::EmberError;
use crate::value::Value;
use crate::vm::Vm;

pub fn install(defs: &mut Vec<NativeDef>) {
    defs.push(NativeDef::new("abs", 1, abs));
    defs.push(NativeDef::new("sqrt", 1, sqrt));
    defs.push(NativeDef::new("floor", 1, floor));
    defs.push(NativeDef::new("ceil", 1, ceil));
    defs.push(NativeDef::new("round", 1, round));
    defs.push(NativeDef::new("max", 2, max));
    defs.push(NativeDef::new("min", 2, min));
    defs.push(NativeDef::new("pow", 2, pow));
}

fn one_number(args: &[Value]) -> Option<f64> {
    match args {
        [Value::Number(n)] => Some(*n),
        _ => None,
    }
}

fn two_numbers(args: &[Value]) -> Option<(f64, f64)> {
    match args {
        [Value::Number(a), Value::Number(b)] => Some((*a, *b)),
        _ => None,
    }
}

fn abs(_vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    Ok(one_number(args).map(|n| Value::Number(n.abs())).unwrap_or(Value::Nil))
}

fn sqrt(_vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    Ok(one_number(args).map(|n| Value::Number(n.sqrt())).unwrap_or(Value::Nil))
}

fn floor(_vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    Ok(one_number(args).map(|n| Value::Number(n.floor())).unwrap_or(Value::Nil))
}

fn ceil(_vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    Ok(one_number(args).map(|n| Value::Number(n.ceil())).unwrap_or(Value::Nil))
}

fn round(_vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    Ok(one_number(args).map(|n| Value::Number(n.round())).unwrap_or(Value::Nil))
}

fn max(_vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    Ok(two_numbers(args).map(|(a, b)| Value::Number(a.max(b))).unwrap_or(Value::Nil))
}

fn min(_vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    Ok(two_numbers(args).map(|(a, b)| Value::Number(a.min(b))).unwrap_or(Value::Nil))
}

fn pow(_vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    Ok(two_numbers(args).map(|(a, b)| Value::Number(a.powf(b))).unwrap_or(Value::Nil))
}
