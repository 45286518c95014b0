// File: src/natives/crypto.rs
//
// Cryptography natives: SHA-2 digests, HMAC-SHA256 (the RFC 2104
// construction over the sha2 crate), and OS-backed random bytes. All
// results are lowercase hex strings. Strict policy: argument mismatches
// raise type errors.

use super::NativeDef;
use crate::errors::EmberError;
use crate::value::Value;
use crate::vm::Vm;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};

const HMAC_BLOCK_SIZE: usize = 64;
const MAX_RANDOM_BYTES: usize = 1024;

pub fn install(defs: &mut Vec<NativeDef>) {
    defs.push(NativeDef::new("sha256", 1, sha256));
    defs.push(NativeDef::new("sha512", 1, sha512));
    defs.push(NativeDef::new("hmac_sha256", 2, hmac_sha256));
    defs.push(NativeDef::new("secure_random", 1, secure_random));
}

fn string_arg(vm: &Vm, args: &[Value], i: usize, native: &str) -> Result<String, EmberError> {
    match args.get(i) {
        Some(Value::Str(h)) => Ok(vm.heap.get_str(*h).to_string()),
        _ => Err(EmberError::type_error(format!("{} requires string arguments", native))),
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

fn sha256(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    if args.len() != 1 {
        return Err(EmberError::type_error("sha256 requires a string argument"));
    }
    let data = string_arg(vm, args, 0, "sha256")?;
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    let digest = hasher.finalize();
    vm.make_string(hex(&digest))
}

fn sha512(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    if args.len() != 1 {
        return Err(EmberError::type_error("sha512 requires a string argument"));
    }
    let data = string_arg(vm, args, 0, "sha512")?;
    let mut hasher = Sha512::new();
    hasher.update(data.as_bytes());
    let digest = hasher.finalize();
    vm.make_string(hex(&digest))
}

fn sha256_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// HMAC-SHA256 per RFC 2104: keys longer than the block are hashed
/// first, then padded with ipad/opad.
fn hmac_sha256(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    if args.len() != 2 {
        return Err(EmberError::type_error(
            "hmac_sha256 requires (key, message) string arguments",
        ));
    }
    let key = string_arg(vm, args, 0, "hmac_sha256")?;
    let message = string_arg(vm, args, 1, "hmac_sha256")?;

    let mut block_key = [0u8; HMAC_BLOCK_SIZE];
    if key.len() > HMAC_BLOCK_SIZE {
        block_key[..32].copy_from_slice(&sha256_digest(key.as_bytes()));
    } else {
        block_key[..key.len()].copy_from_slice(key.as_bytes());
    }

    let mut inner = Vec::with_capacity(HMAC_BLOCK_SIZE + message.len());
    for byte in &block_key {
        inner.push(byte ^ 0x36);
    }
    inner.extend_from_slice(message.as_bytes());
    let inner_digest = sha256_digest(&inner);

    let mut outer = Vec::with_capacity(HMAC_BLOCK_SIZE + 32);
    for byte in &block_key {
        outer.push(byte ^ 0x5c);
    }
    outer.extend_from_slice(&inner_digest);

    vm.make_string(hex(&sha256_digest(&outer)))
}

/// secure_random(n): n bytes from the OS entropy source, hex-encoded.
fn secure_random(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    let n = match args {
        [Value::Number(n)] => *n,
        _ => return Err(EmberError::type_error("secure_random requires a number argument")),
    };
    if n < 1.0 || n > MAX_RANDOM_BYTES as f64 || n.fract() != 0.0 {
        return Err(EmberError::runtime(format!(
            "secure_random size must be an integer in 1..={}",
            MAX_RANDOM_BYTES
        )));
    }
    let mut bytes = vec![0u8; n as usize];
    OsRng.fill_bytes(&mut bytes);
    vm.make_string(hex(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn str_val(vm: &mut Vm, s: &str) -> Value {
        vm.make_string(s).unwrap()
    }

    #[test]
    fn test_sha256_known_vector() {
        let mut vm = Vm::new();
        let input = str_val(&mut vm, "abc");
        let digest = sha256(&mut vm, &[input]).unwrap();
        assert_eq!(
            vm.get_string(&digest),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn test_sha512_known_vector() {
        let mut vm = Vm::new();
        let input = str_val(&mut vm, "abc");
        let digest = sha512(&mut vm, &[input]).unwrap();
        assert_eq!(
            vm.get_string(&digest),
            Some(
                "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
                 2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
            )
        );
    }

    #[test]
    fn test_hmac_sha256_rfc4231_case_2() {
        let mut vm = Vm::new();
        let key = str_val(&mut vm, "Jefe");
        let msg = str_val(&mut vm, "what do ya want for nothing?");
        let mac = hmac_sha256(&mut vm, &[key, msg]).unwrap();
        assert_eq!(
            vm.get_string(&mac),
            Some("5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843")
        );
    }

    #[test]
    fn test_hmac_long_key_is_hashed_first() {
        let mut vm = Vm::new();
        let long_key = "k".repeat(100);
        let key = vm.make_string(long_key).unwrap();
        let msg = str_val(&mut vm, "data");
        let mac = hmac_sha256(&mut vm, &[key, msg]).unwrap();
        // 32-byte digest, hex-encoded
        assert_eq!(vm.get_string(&mac).unwrap().len(), 64);
    }

    #[test]
    fn test_secure_random_length_and_hex() {
        let mut vm = Vm::new();
        let r = secure_random(&mut vm, &[Value::Number(16.0)]).unwrap();
        let text = vm.get_string(&r).unwrap();
        assert_eq!(text.len(), 32);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_secure_random_rejects_bad_sizes() {
        let mut vm = Vm::new();
        assert!(secure_random(&mut vm, &[Value::Number(0.0)]).is_err());
        assert!(secure_random(&mut vm, &[Value::Number(1.5)]).is_err());
        assert!(secure_random(&mut vm, &[Value::Number(4096.0)]).is_err());
        assert!(secure_random(&mut vm, &[Value::Nil]).is_err());
    }

    #[test]
    fn test_digest_type_errors() {
        let mut vm = Vm::new();
        assert!(sha256(&mut vm, &[Value::Number(1.0)]).is_err());
        assert!(sha256(&mut vm, &[]).is_err());
        assert!(hmac_sha256(&mut vm, &[Value::Nil, Value::Nil]).is_err());
    }
}
