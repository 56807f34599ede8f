//! Host functions exposed to scripts, registered into the VM's globals at
//! startup. The table is a flat name -> function list walked once at
//! construction; the only native this language actually requires is `clock`.

use compiler::{Gc, NativeFn, Table, Value};
use std::time::{SystemTime, UNIX_EPOCH};

fn clock(args: &[Value]) -> Result<Value, String> {
    if !args.is_empty() {
        return Err(format!("Expected 0 arguments but got {}.", args.len()));
    }
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| "System clock is before the Unix epoch.".to_string())?;
    Ok(Value::from(elapsed.as_secs_f64()))
}

const NATIVES: &[(&str, u8, NativeFn)] = &[("clock", 0, clock)];

/// Interns every native's name and installs it as a global bound to a fresh
/// `ObjNative`. Called once when a [`crate::Vm`] is constructed.
pub fn register(gc: &mut Gc, globals: &mut Table) {
    for &(name, arity, function) in NATIVES {
        let interned = gc.intern(name);
        let native = gc.alloc_native(name, arity, function);
        globals.set(interned, Value::Obj(native.erase()));
    }
}
