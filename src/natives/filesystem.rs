// File: src/natives/filesystem.rs
//
// File I/O natives. Every operation goes through the VM's virtual
// filesystem; there is no way to name a host path directly. Strict
// policy: argument mismatches and I/O failures raise typed errors
// (Security for mount violations, IO for host failures).

use super::NativeDef;
use crate::errors::EmberError;
use crate::value::Value;
use crate::vm::Vm;

pub fn install(defs: &mut Vec<NativeDef>) {
    defs.push(NativeDef::new("read_file", 1, read_file));
    defs.push(NativeDef::new("write_file", 2, write_file));
    defs.push(NativeDef::new("append_file", 2, append_file));
    defs.push(NativeDef::new("file_exists", 1, file_exists));
}

fn path_arg(vm: &Vm, args: &[Value], i: usize, native: &str) -> Result<String, EmberError> {
    match args.get(i) {
        Some(Value::Str(h)) => Ok(vm.heap.get_str(*h).to_string()),
        _ => Err(EmberError::type_error(format!(
            "{} requires a string path argument",
            native
        ))),
    }
}

fn read_file(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    if args.len() != 1 {
        return Err(EmberError::type_error("read_file requires a string path argument"));
    }
    let path = path_arg(vm, args, 0, "read_file")?;
    let contents = vm.vfs.read(&path)?;
    vm.make_string(contents)
}

fn write_file(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    if args.len() != 2 {
        return Err(EmberError::type_error(
            "write_file requires (path, content) string arguments",
        ));
    }
    let path = path_arg(vm, args, 0, "write_file")?;
    let content = match args.get(1) {
        Some(Value::Str(h)) => vm.heap.get_str(*h).to_string(),
        _ => {
            return Err(EmberError::type_error(
                "write_file requires (path, content) string arguments",
            ))
        }
    };
    vm.vfs.write(&path, &content, false)?;
    Ok(Value::Bool(true))
}

fn append_file(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    if args.len() != 2 {
        return Err(EmberError::type_error(
            "append_file requires (path, content) string arguments",
        ));
    }
    let path = path_arg(vm, args, 0, "append_file")?;
    let content = match args.get(1) {
        Some(Value::Str(h)) => vm.heap.get_str(*h).to_string(),
        _ => {
            return Err(EmberError::type_error(
                "append_file requires (path, content) string arguments",
            ))
        }
    };
    vm.vfs.write(&path, &content, true)?;
    Ok(Value::Bool(true))
}

fn file_exists(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    if args.len() != 1 {
        return Err(EmberError::type_error("file_exists requires a string path argument"));
    }
    let path = path_arg(vm, args, 0, "file_exists")?;
    Ok(Value::Bool(vm.vfs.exists(&path)))
}
