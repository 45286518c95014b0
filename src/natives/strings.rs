// File: src/natives/strings.rs
//
// String native functions. Lenient policy throughout: nil on argc or
// argument-kind mismatch. Strings are length-bearing byte strings;
// `substr` and `index_of` operate on characters so multi-byte text
// never splits inside a code point.

use super::NativeDef;
use crate::errors::EmberError;
use crate::value::Value;
use crate::vm::Vm;

pub fn install(defs: &mut Vec<NativeDef>) {
    defs.push(NativeDef::new("substr", 3, substr));
    defs.push(NativeDef::new("split", 2, split));
    defs.push(NativeDef::new("join", 2, join));
    defs.push(NativeDef::new("starts_with", 2, starts_with));
    defs.push(NativeDef::new("ends_with", 2, ends_with));
    defs.push(NativeDef::new("trim", 1, trim));
    defs.push(NativeDef::new("upper", 1, upper));
    defs.push(NativeDef::new("lower", 1, lower));
    defs.push(NativeDef::new("replace", 3, replace));
    defs.push(NativeDef::new("index_of", 2, index_of));
}

fn string_arg<'a>(vm: &'a Vm, args: &[Value], i: usize) -> Option<&'a str> {
    match args.get(i) {
        Some(Value::Str(h)) => Some(vm.heap.get_str(*h)),
        _ => None,
    }
}

/// substr(s, start, length) in characters; clamped at the string end.
fn substr(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    if args.len() != 3 {
        return Ok(Value::Nil);
    }
    let (start, length) = match (args[1], args[2]) {
        (Value::Number(a), Value::Number(b)) if a >= 0.0 && b >= 0.0 => {
            (a as usize, b as usize)
        }
        _ => return Ok(Value::Nil),
    };
    let Some(s) = string_arg(vm, args, 0) else { return Ok(Value::Nil) };
    let result: String = s.chars().skip(start).take(length).collect();
    vm.make_string(result)
}

/// split(s, d): d-separated segments with empty segments preserved.
fn split(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    if args.len() != 2 {
        return Ok(Value::Nil);
    }
    let (s, d) = match (string_arg(vm, args, 0), string_arg(vm, args, 1)) {
        (Some(s), Some(d)) if !d.is_empty() => (s.to_string(), d.to_string()),
        _ => return Ok(Value::Nil),
    };
    let mut parts = Vec::new();
    for part in s.split(&d) {
        parts.push(vm.make_string(part)?);
    }
    vm.make_array(parts)
}

/// join(arr, d): elements formatted with the print format.
fn join(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    if args.len() != 2 {
        return Ok(Value::Nil);
    }
    let items = match args[0] {
        Value::Array(h) => vm.heap.get_array(h).clone(),
        _ => return Ok(Value::Nil),
    };
    let Some(d) = string_arg(vm, args, 1) else { return Ok(Value::Nil) };
    let d = d.to_string();
    let joined = items
        .iter()
        .map(|v| vm.format_value(v))
        .collect::<Vec<String>>()
        .join(&d);
    vm.make_string(joined)
}

fn starts_with(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    match (string_arg(vm, args, 0), string_arg(vm, args, 1)) {
        (Some(s), Some(prefix)) if args.len() == 2 => Ok(Value::Bool(s.starts_with(prefix))),
        _ => Ok(Value::Nil),
    }
}

fn ends_with(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    match (string_arg(vm, args, 0), string_arg(vm, args, 1)) {
        (Some(s), Some(suffix)) if args.len() == 2 => Ok(Value::Bool(s.ends_with(suffix))),
        _ => Ok(Value::Nil),
    }
}

fn trim(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    if args.len() != 1 {
        return Ok(Value::Nil);
    }
    match string_arg(vm, args, 0) {
        Some(s) => {
            let trimmed = s.trim().to_string();
            vm.make_string(trimmed)
        }
        None => Ok(Value::Nil),
    }
}

fn upper(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    if args.len() != 1 {
        return Ok(Value::Nil);
    }
    match string_arg(vm, args, 0) {
        Some(s) => {
            let upper = s.to_uppercase();
            vm.make_string(upper)
        }
        None => Ok(Value::Nil),
    }
}

fn lower(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    if args.len() != 1 {
        return Ok(Value::Nil);
    }
    match string_arg(vm, args, 0) {
        Some(s) => {
            let lower = s.to_lowercase();
            vm.make_string(lower)
        }
        None => Ok(Value::Nil),
    }
}

fn replace(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    if args.len() != 3 {
        return Ok(Value::Nil);
    }
    match (string_arg(vm, args, 0), string_arg(vm, args, 1), string_arg(vm, args, 2)) {
        (Some(s), Some(from), Some(to)) if !from.is_empty() => {
            let replaced = s.replace(from, to);
            vm.make_string(replaced)
        }
        _ => Ok(Value::Nil),
    }
}

/// Character index of the first occurrence, or -1.
fn index_of(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    match (string_arg(vm, args, 0), string_arg(vm, args, 1)) {
        (Some(s), Some(needle)) if args.len() == 2 => match s.find(needle) {
            Some(byte_pos) => {
                let char_pos = s[..byte_pos].chars().count();
                Ok(Value::Number(char_pos as f64))
            }
            None => Ok(Value::Number(-1.0)),
        },
        _ => Ok(Value::Nil),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn str_val(vm: &mut Vm, s: &str) -> Value {
        vm.make_string(s).unwrap()
    }

    #[test]
    fn test_substr() {
        let mut vm = Vm::new();
        let s = str_val(&mut vm, "hello world");
        let r = substr(&mut vm, &[s, Value::Number(6.0), Value::Number(5.0)]).unwrap();
        assert_eq!(vm.get_string(&r), Some("world"));
        // Clamped past the end
        let r = substr(&mut vm, &[s, Value::Number(6.0), Value::Number(100.0)]).unwrap();
        assert_eq!(vm.get_string(&r), Some("world"));
        // Negative start is a mismatch
        let r = substr(&mut vm, &[s, Value::Number(-1.0), Value::Number(2.0)]).unwrap();
        assert_eq!(r, Value::Nil);
    }

    #[test]
    fn test_split_preserves_empty_segments() {
        let mut vm = Vm::new();
        let s = str_val(&mut vm, "a,,b,");
        let d = str_val(&mut vm, ",");
        let r = split(&mut vm, &[s, d]).unwrap();
        match r {
            Value::Array(h) => {
                let parts: Vec<String> = vm
                    .heap
                    .get_array(h)
                    .iter()
                    .map(|v| vm.get_string(v).unwrap().to_string())
                    .collect();
                assert_eq!(parts, vec!["a", "", "b", ""]);
            }
            other => panic!("expected array from split, got {:?}", other),
        }
    }

    #[test]
    fn test_join_inverts_split() {
        let mut vm = Vm::new();
        let original = "one:two::three";
        let s = str_val(&mut vm, original);
        let d = str_val(&mut vm, ":");
        let parts = split(&mut vm, &[s, d]).unwrap();
        let joined = join(&mut vm, &[parts, d]).unwrap();
        assert_eq!(vm.get_string(&joined), Some(original));
    }

    #[test]
    fn test_split_segment_count() {
        let mut vm = Vm::new();
        let s = str_val(&mut vm, "x;y;z");
        let d = str_val(&mut vm, ";");
        let r = split(&mut vm, &[s, d]).unwrap();
        match r {
            Value::Array(h) => assert_eq!(vm.heap.get_array(h).len(), 3),
            other => panic!("expected array, got {:?}", other),
        }
    }

    #[test]
    fn test_starts_ends_with() {
        let mut vm = Vm::new();
        let s = str_val(&mut vm, "ember.ember");
        let prefix = str_val(&mut vm, "emb");
        let suffix = str_val(&mut vm, ".ember");
        assert_eq!(starts_with(&mut vm, &[s, prefix]).unwrap(), Value::Bool(true));
        assert_eq!(ends_with(&mut vm, &[s, suffix]).unwrap(), Value::Bool(true));
        assert_eq!(starts_with(&mut vm, &[s, suffix]).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_trim_upper_lower_replace() {
        let mut vm = Vm::new();
        let s = str_val(&mut vm, "  MiXeD  ");
        let t = trim(&mut vm, &[s]).unwrap();
        assert_eq!(vm.get_string(&t), Some("MiXeD"));
        let u = upper(&mut vm, &[t]).unwrap();
        assert_eq!(vm.get_string(&u), Some("MIXED"));
        let l = lower(&mut vm, &[t]).unwrap();
        assert_eq!(vm.get_string(&l), Some("mixed"));

        let s = str_val(&mut vm, "a-b-c");
        let from = str_val(&mut vm, "-");
        let to = str_val(&mut vm, "_");
        let r = replace(&mut vm, &[s, from, to]).unwrap();
        assert_eq!(vm.get_string(&r), Some("a_b_c"));
    }

    #[test]
    fn test_index_of() {
        let mut vm = Vm::new();
        let s = str_val(&mut vm, "hello");
        let needle = str_val(&mut vm, "llo");
        assert_eq!(index_of(&mut vm, &[s, needle]).unwrap(), Value::Number(2.0));
        let missing = str_val(&mut vm, "xyz");
        assert_eq!(index_of(&mut vm, &[s, missing]).unwrap(), Value::Number(-1.0));
    }

    #[test]
    fn test_mismatches_return_nil() {
        let mut vm = Vm::new();
        assert_eq!(split(&mut vm, &[Value::Number(1.0), Value::Nil]).unwrap(), Value::Nil);
        assert_eq!(trim(&mut vm, &[]).unwrap(), Value::Nil);
        let s = str_val(&mut vm, "a");
        let empty = str_val(&mut vm, "");
        // Empty delimiter is a mismatch, not an infinite split
        assert_eq!(split(&mut vm, &[s, empty]).unwrap(), Value::Nil);
    }
}
