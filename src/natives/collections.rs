// File: src/natives/collections.rs
//
// Aggregate helpers for arrays, maps, and sets. Lenient policy: nil on
// argc or argument-kind mismatch.

use super::NativeDef;
use crate::errors::EmberError;
use crate::heap::HeapObject;
use crate::value::Value;
use crate::vm::Vm;

pub fn install(defs: &mut Vec<NativeDef>) {
    defs.push(NativeDef::new("push", 2, push));
    defs.push(NativeDef::new("pop", 1, pop));
    defs.push(NativeDef::new("keys", 1, keys));
    defs.push(NativeDef::new("values", 1, values));
    defs.push(NativeDef::new("has", 2, has));
    defs.push(NativeDef::new("contains", 2, contains));
    defs.push(NativeDef::new("set", 0, make_set));
    defs.push(NativeDef::new("set_add", 2, set_add));
}

/// push(arr, v): append and return the array for chaining.
fn push(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    match args {
        [Value::Array(h), value] => {
            vm.heap.get_array_mut(*h).push(*value);
            vm.heap.note_array_growth(1);
            Ok(Value::Array(*h))
        }
        _ => Ok(Value::Nil),
    }
}

/// pop(arr): remove and return the last element; nil when empty.
fn pop(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    match args {
        [Value::Array(h)] => Ok(vm.heap.get_array_mut(*h).pop().unwrap_or(Value::Nil)),
        _ => Ok(Value::Nil),
    }
}

/// keys(map): the map's keys as an array, in insertion order.
fn keys(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    match args {
        [Value::Map(h)] => {
            let keys: Vec<Value> = match vm.heap.get(*h) {
                HeapObject::Map(m) => m.entries().iter().map(|e| e.key).collect(),
                _ => return Ok(Value::Nil),
            };
            vm.make_array(keys)
        }
        _ => Ok(Value::Nil),
    }
}

/// values(map): the map's values as an array, in insertion order.
fn values(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    match args {
        [Value::Map(h)] => {
            let values: Vec<Value> = match vm.heap.get(*h) {
                HeapObject::Map(m) => m.entries().iter().map(|e| e.value).collect(),
                _ => return Ok(Value::Nil),
            };
            vm.make_array(values)
        }
        _ => Ok(Value::Nil),
    }
}

/// has(map, key): key presence under the map's key equality.
fn has(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    match args {
        [Value::Map(h), key] => Ok(Value::Bool(vm.heap.map_get(*h, key).is_some())),
        [Value::Set(h), item] => Ok(Value::Bool(vm.heap.set_contains(*h, item))),
        _ => Ok(Value::Nil),
    }
}

/// contains(collection, v): membership for arrays (structural equality),
/// sets, maps (key), and strings (substring).
fn contains(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    match args {
        [Value::Array(h), value] => {
            let items = vm.heap.get_array(*h);
            let found = items.iter().any(|item| vm.heap.values_equal(item, value));
            Ok(Value::Bool(found))
        }
        [Value::Set(h), item] => Ok(Value::Bool(vm.heap.set_contains(*h, item))),
        [Value::Map(h), key] => Ok(Value::Bool(vm.heap.map_get(*h, key).is_some())),
        [Value::Str(h), Value::Str(needle)] => {
            let found = vm.heap.get_str(*h).contains(vm.heap.get_str(*needle));
            Ok(Value::Bool(found))
        }
        _ => Ok(Value::Nil),
    }
}

/// set(...): a new set of the given items.
fn make_set(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    let set = vm.make_set()?;
    if let Value::Set(h) = set {
        for item in args {
            vm.heap.set_add(h, *item);
        }
    }
    Ok(set)
}

/// set_add(s, v): insert and report whether the item was new.
fn set_add(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    match args {
        [Value::Set(h), item] => Ok(Value::Bool(vm.heap.set_add(*h, *item))),
        _ => Ok(Value::Nil),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop() {
        let mut vm = Vm::new();
        let arr = vm.make_array(vec![Value::Number(1.0)]).unwrap();
        push(&mut vm, &[arr, Value::Number(2.0)]).unwrap();
        match arr {
            Value::Array(h) => assert_eq!(vm.heap.get_array(h).len(), 2),
            _ => unreachable!(),
        }
        assert_eq!(pop(&mut vm, &[arr]).unwrap(), Value::Number(2.0));
        assert_eq!(pop(&mut vm, &[arr]).unwrap(), Value::Number(1.0));
        assert_eq!(pop(&mut vm, &[arr]).unwrap(), Value::Nil);
    }

    #[test]
    fn test_keys_values_order() {
        let mut vm = Vm::new();
        let map = vm.make_map().unwrap();
        let Value::Map(h) = map else { unreachable!() };
        let k1 = vm.make_string("a").unwrap();
        let k2 = vm.make_string("b").unwrap();
        vm.heap.map_insert(h, k1, Value::Number(1.0));
        vm.heap.map_insert(h, k2, Value::Number(2.0));

        let ks = keys(&mut vm, &[map]).unwrap();
        let Value::Array(kh) = ks else { panic!("expected array of keys") };
        let names: Vec<String> = vm
            .heap
            .get_array(kh)
            .iter()
            .map(|v| vm.get_string(v).unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        let vs = values(&mut vm, &[map]).unwrap();
        let Value::Array(vh) = vs else { panic!("expected array of values") };
        assert_eq!(vm.heap.get_array(vh).as_slice(), &[Value::Number(1.0), Value::Number(2.0)]);
    }

    #[test]
    fn test_set_membership() {
        let mut vm = Vm::new();
        let s = make_set(&mut vm, &[Value::Number(1.0), Value::Number(1.0)]).unwrap();
        let Value::Set(h) = s else { unreachable!() };
        assert_eq!(vm.heap.set_len(h), 1);
        assert_eq!(has(&mut vm, &[s, Value::Number(1.0)]).unwrap(), Value::Bool(true));
        assert_eq!(has(&mut vm, &[s, Value::Number(2.0)]).unwrap(), Value::Bool(false));
        assert_eq!(set_add(&mut vm, &[s, Value::Number(2.0)]).unwrap(), Value::Bool(true));
        assert_eq!(set_add(&mut vm, &[s, Value::Number(2.0)]).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_contains_for_arrays_and_strings() {
        let mut vm = Vm::new();
        let s1 = vm.make_string("x").unwrap();
        let arr = vm.make_array(vec![s1, Value::Number(2.0)]).unwrap();
        let s2 = vm.make_string("x").unwrap();
        // Structural equality: a different heap string with equal bytes
        assert_eq!(contains(&mut vm, &[arr, s2]).unwrap(), Value::Bool(true));

        let hay = vm.make_string("hello").unwrap();
        let needle = vm.make_string("ell").unwrap();
        assert_eq!(contains(&mut vm, &[hay, needle]).unwrap(), Value::Bool(true));
    }
}
