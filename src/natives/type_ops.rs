// File: src/natives/type_ops.rs
//
// Type inspection, explicit conversions, printing, and length. There is
// no implicit coercion in arithmetic; `str`/`num`/`int`/`bool` are the
// only conversions. `type` and `not` are strict about arity; the
// conversions are lenient and return nil.

use super::NativeDef;
use crate::errors::EmberError;
use crate::value::Value;
use crate::vm::Vm;

pub fn install(defs: &mut Vec<NativeDef>) {
    defs.push(NativeDef::new("print", 1, print));
    defs.push(NativeDef::new("type", 1, type_of));
    defs.push(NativeDef::new("not", 1, not));
    defs.push(NativeDef::new("str", 1, to_str));
    defs.push(NativeDef::new("num", 1, to_num));
    defs.push(NativeDef::new("int", 1, to_int));
    defs.push(NativeDef::new("bool", 1, to_bool));
    defs.push(NativeDef::new("len", 1, len));
}

fn print(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    let text = args
        .iter()
        .map(|v| vm.format_value(v))
        .collect::<Vec<String>>()
        .join(" ");
    vm.write_line(&text);
    Ok(Value::Nil)
}

fn type_of(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    match args {
        [value] => vm.make_string(value.type_name()),
        _ => Err(EmberError::type_error("type expects exactly one argument")),
    }
}

fn not(_vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    match args {
        [value] => Ok(Value::Bool(!value.is_truthy())),
        _ => Err(EmberError::type_error("not expects exactly one argument")),
    }
}

fn to_str(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    match args {
        [value] => {
            let text = vm.format_value(value);
            vm.make_string(text)
        }
        _ => Ok(Value::Nil),
    }
}

/// `num("  12.5 ")` is 12.5, `num("12x")` is nil, `num(true)` is 1.
fn to_num(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    match args {
        [Value::Number(n)] => Ok(Value::Number(*n)),
        [Value::Bool(b)] => Ok(Value::Number(if *b { 1.0 } else { 0.0 })),
        [Value::Str(h)] => {
            let text = vm.heap.get_str(*h).trim();
            match text.parse::<f64>() {
                Ok(n) => Ok(Value::Number(n)),
                Err(_) => Ok(Value::Nil),
            }
        }
        _ => Ok(Value::Nil),
    }
}

fn to_int(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    match to_num(vm, args)? {
        Value::Number(n) => Ok(Value::Number(n.trunc())),
        other => Ok(other),
    }
}

fn to_bool(_vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    match args {
        [value] => Ok(Value::Bool(value.is_truthy())),
        _ => Ok(Value::Nil),
    }
}

/// Byte length for strings, element count for aggregates.
fn len(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    let value = match args {
        [value] => value,
        _ => return Ok(Value::Nil),
    };
    let n = match value {
        Value::Str(h) => vm.heap.get_str(*h).len(),
        Value::Array(h) => vm.heap.get_array(*h).len(),
        Value::Map(h) => vm.heap.map_len(*h),
        Value::Set(h) => vm.heap.set_len(*h),
        _ => return Ok(Value::Nil),
    };
    Ok(Value::Number(n as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_conversions() {
        let mut vm = Vm::new();
        let s = vm.make_string("  12.5 ").unwrap();
        assert_eq!(to_num(&mut vm, &[s]).unwrap(), Value::Number(12.5));

        let s = vm.make_string("12x").unwrap();
        assert_eq!(to_num(&mut vm, &[s]).unwrap(), Value::Nil);

        assert_eq!(to_num(&mut vm, &[Value::Bool(true)]).unwrap(), Value::Number(1.0));
        assert_eq!(to_num(&mut vm, &[Value::Nil]).unwrap(), Value::Nil);
    }

    #[test]
    fn test_int_truncates_toward_zero() {
        let mut vm = Vm::new();
        assert_eq!(to_int(&mut vm, &[Value::Number(2.9)]).unwrap(), Value::Number(2.0));
        assert_eq!(to_int(&mut vm, &[Value::Number(-2.9)]).unwrap(), Value::Number(-2.0));
    }

    #[test]
    fn test_bool_follows_truthiness() {
        let mut vm = Vm::new();
        assert_eq!(to_bool(&mut vm, &[Value::Number(0.0)]).unwrap(), Value::Bool(false));
        assert_eq!(to_bool(&mut vm, &[Value::Number(f64::NAN)]).unwrap(), Value::Bool(false));
        assert_eq!(to_bool(&mut vm, &[Value::Nil]).unwrap(), Value::Bool(false));
        let s = vm.make_string("").unwrap();
        assert_eq!(to_bool(&mut vm, &[s]).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_type_names() {
        let mut vm = Vm::new();
        let t = type_of(&mut vm, &[Value::Number(1.0)]).unwrap();
        assert_eq!(vm.get_string(&t), Some("number"));
        let arr = vm.make_array(vec![]).unwrap();
        let t = type_of(&mut vm, &[arr]).unwrap();
        assert_eq!(vm.get_string(&t), Some("array"));
        assert!(type_of(&mut vm, &[]).is_err());
    }

    #[test]
    fn test_str_of_number_round_trips() {
        let mut vm = Vm::new();
        let s = to_str(&mut vm, &[Value::Number(12.5)]).unwrap();
        assert_eq!(vm.get_string(&s), Some("12.5"));
        let back = to_num(&mut vm, &[s]).unwrap();
        assert_eq!(back, Value::Number(12.5));
    }

    #[test]
    fn test_len_by_kind() {
        let mut vm = Vm::new();
        let s = vm.make_string("hello").unwrap();
        assert_eq!(len(&mut vm, &[s]).unwrap(), Value::Number(5.0));
        let arr = vm.make_array(vec![Value::Nil, Value::Nil]).unwrap();
        assert_eq!(len(&mut vm, &[arr]).unwrap(), Value::Number(2.0));
        assert_eq!(len(&mut vm, &[Value::Number(3.0)]).unwrap(), Value::Nil);
    }
}
