//! Process-wide registries and the embedder surface
//!
//! The shard registry, object/enum type registries, the named-wire table,
//! the root path, and the run-loop/exit callback lists are startup-shaped
//! global state: registration locks briefly, lookups clone small handles
//! out of the lock. Built-in shards self-register on first use.

use crate::error::{Result, RuntimeError};
use crate::shard::ShardBox;
use crate::value::Value;
use crate::wire::Wire;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Once, OnceLock};

/// Bumped whenever the embedder-visible surface changes shape.
pub const ABI_VERSION: u32 = 0x2009_0001;

pub type ShardFactory = fn() -> ShardBox;

/// Identity of a registered opaque object type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectTypeInfo {
    pub vendor_id: i32,
    pub type_id: i32,
    pub name: &'static str,
}

/// Identity and labels of a registered enum type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumTypeInfo {
    pub vendor_id: i32,
    pub type_id: i32,
    pub name: &'static str,
    pub labels: Vec<&'static str>,
}

#[derive(Default)]
struct Registry {
    shards: Mutex<HashMap<&'static str, ShardFactory>>,
    objects: Mutex<HashMap<(i32, i32), ObjectTypeInfo>>,
    enums: Mutex<HashMap<(i32, i32), EnumTypeInfo>>,
    wires: Mutex<HashMap<String, Wire>>,
    root_path: Mutex<String>,
    run_loop_callbacks: Mutex<Vec<(u64, Box<dyn FnMut() + Send>)>>,
    exit_callbacks: Mutex<Vec<(u64, Box<dyn FnMut() + Send>)>>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static BUILTINS: Once = Once::new();
static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry {
        root_path: Mutex::new(".".to_string()),
        ..Default::default()
    })
}

/// Built-in registration happens on the first lookup, never inside
/// `register_shard` itself — registration must stay re-entrant for the
/// builtins to install themselves.
fn ensure_builtins() {
    BUILTINS.call_once(crate::shards::register_builtin_shards);
}

/// Register a shard constructor under its public name. Last registration
/// wins, which is also how hosts shadow a built-in.
pub fn register_shard(name: &'static str, factory: ShardFactory) {
    registry()
        .shards
        .lock()
        .expect("registry lock poisoned")
        .insert(name, factory);
}

/// Instantiate a registered shard by name.
pub fn create_shard(name: &str) -> Result<ShardBox> {
    ensure_builtins();
    let factory = registry()
        .shards
        .lock()
        .expect("registry lock poisoned")
        .get(name)
        .copied();
    match factory {
        Some(f) => Ok(f()),
        None => Err(RuntimeError::compose(format!("unknown shard: {name}"))),
    }
}

/// All registered shard names, sorted.
pub fn get_shards() -> Vec<&'static str> {
    ensure_builtins();
    let mut names: Vec<&'static str> = registry()
        .shards
        .lock()
        .expect("registry lock poisoned")
        .keys()
        .copied()
        .collect();
    names.sort_unstable();
    names
}

/// Validate a parameter assignment without mutating the shard: index range,
/// declared type acceptance, and value-level bounds.
pub fn validate_set_param(shard: &dyn crate::shard::Shard, index: usize, value: &Value) -> Result<()> {
    let params = shard.parameters();
    let info = params
        .get(index)
        .ok_or(RuntimeError::InvalidParameterIndex { shard: shard.name(), index })?;
    let derived = crate::types::TypeInfo::derive(value);
    if !info.types.iter().any(|t| derived.matches(t)) {
        return Err(RuntimeError::invalid_var_type(format!(
            "parameter {} of {} does not accept {}",
            info.name,
            shard.name(),
            value.kind()
        )));
    }
    for t in &info.types {
        if derived.matches(t) {
            t.validate(value)?;
            break;
        }
    }
    Ok(())
}

pub fn register_object_type(info: ObjectTypeInfo) {
    registry()
        .objects
        .lock()
        .expect("registry lock poisoned")
        .insert((info.vendor_id, info.type_id), info);
}

pub fn find_object_type(vendor_id: i32, type_id: i32) -> Option<ObjectTypeInfo> {
    registry()
        .objects
        .lock()
        .expect("registry lock poisoned")
        .get(&(vendor_id, type_id))
        .cloned()
}

pub fn register_enum_type(info: EnumTypeInfo) {
    registry()
        .enums
        .lock()
        .expect("registry lock poisoned")
        .insert((info.vendor_id, info.type_id), info);
}

pub fn find_enum_type(vendor_id: i32, type_id: i32) -> Option<EnumTypeInfo> {
    registry()
        .enums
        .lock()
        .expect("registry lock poisoned")
        .get(&(vendor_id, type_id))
        .cloned()
}

// ---- named wires ----

/// Publish a wire under a global name; control shards resolve string
/// references through this table.
pub fn set_global_wire(name: impl Into<String>, wire: Wire) {
    registry()
        .wires
        .lock()
        .expect("registry lock poisoned")
        .insert(name.into(), wire);
}

pub fn get_global_wire(name: &str) -> Option<Wire> {
    registry()
        .wires
        .lock()
        .expect("registry lock poisoned")
        .get(name)
        .cloned()
}

pub fn unset_global_wire(name: &str) -> Option<Wire> {
    registry()
        .wires
        .lock()
        .expect("registry lock poisoned")
        .remove(name)
}

// ---- root path ----

pub fn get_root_path() -> String {
    registry().root_path.lock().expect("registry lock poisoned").clone()
}

pub fn set_root_path(path: impl Into<String>) {
    *registry().root_path.lock().expect("registry lock poisoned") = path.into();
}

// ---- lifecycle callbacks ----

/// Register a callback invoked on every host run-loop turn. Returns the id
/// used to unregister.
pub fn register_run_loop_callback(f: impl FnMut() + Send + 'static) -> u64 {
    let id = NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed);
    registry()
        .run_loop_callbacks
        .lock()
        .expect("registry lock poisoned")
        .push((id, Box::new(f)));
    id
}

pub fn unregister_run_loop_callback(id: u64) {
    registry()
        .run_loop_callbacks
        .lock()
        .expect("registry lock poisoned")
        .retain(|(cid, _)| *cid != id);
}

/// Invoke every run-loop callback once. Hosts call this from their tick
/// loop.
pub fn run_loop_callbacks() {
    let mut callbacks = registry()
        .run_loop_callbacks
        .lock()
        .expect("registry lock poisoned");
    for (_, f) in callbacks.iter_mut() {
        f();
    }
}

pub fn register_exit_callback(f: impl FnMut() + Send + 'static) -> u64 {
    let id = NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed);
    registry()
        .exit_callbacks
        .lock()
        .expect("registry lock poisoned")
        .push((id, Box::new(f)));
    id
}

pub fn unregister_exit_callback(id: u64) {
    registry()
        .exit_callbacks
        .lock()
        .expect("registry lock poisoned")
        .retain(|(cid, _)| *cid != id);
}

/// Invoke and drop every exit callback. Hosts call this once at shutdown.
pub fn run_exit_callbacks() {
    let mut callbacks = {
        let mut guard = registry().exit_callbacks.lock().expect("registry lock poisoned");
        std::mem::take(&mut *guard)
    };
    for (_, f) in callbacks.iter_mut() {
        f();
    }
}

// ---- embedder handshake ----

/// The function table an embedder acquires after the version handshake.
/// Everything else on the surface hangs off the handles these return.
pub struct CoreInterface {
    pub create_shard: fn(&str) -> Result<ShardBox>,
    pub register_shard: fn(&'static str, ShardFactory),
    pub get_shards: fn() -> Vec<&'static str>,
    pub get_root_path: fn() -> String,
    pub get_global_wire: fn(&str) -> Option<Wire>,
}

/// Version handshake: a mismatched token is a fatal init error.
pub fn acquire_interface(abi_version: u32) -> Result<CoreInterface> {
    if abi_version != ABI_VERSION {
        return Err(RuntimeError::compose(format!(
            "ABI mismatch: host built against {abi_version:#x}, runtime is {ABI_VERSION:#x}"
        )));
    }
    Ok(CoreInterface {
        create_shard,
        register_shard,
        get_shards,
        get_root_path,
        get_global_wire,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::AtomicUsize;

    #[test]
    #[serial]
    fn test_builtin_shards_available() {
        let shard = create_shard("Const").unwrap();
        assert_eq!(shard.name(), "Const");
        assert!(get_shards().contains(&"Do"));
        assert!(create_shard("NoSuchShard").is_err());
    }

    #[test]
    #[serial]
    fn test_global_wire_table() {
        let w = Wire::new("published");
        set_global_wire("published", w.clone());
        assert!(get_global_wire("published").unwrap().same_wire(&w));
        assert!(unset_global_wire("published").is_some());
        assert!(get_global_wire("published").is_none());
    }

    #[test]
    #[serial]
    fn test_root_path_roundtrip() {
        let old = get_root_path();
        set_root_path("/tmp/weft");
        assert_eq!(get_root_path(), "/tmp/weft");
        set_root_path(old);
    }

    #[test]
    #[serial]
    fn test_run_loop_callbacks() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        let id = register_run_loop_callback(|| {
            HITS.fetch_add(1, Ordering::SeqCst);
        });
        run_loop_callbacks();
        run_loop_callbacks();
        assert_eq!(HITS.load(Ordering::SeqCst), 2);
        unregister_run_loop_callback(id);
        run_loop_callbacks();
        assert_eq!(HITS.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[serial]
    fn test_exit_callbacks_fire_once() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        register_exit_callback(|| {
            HITS.fetch_add(1, Ordering::SeqCst);
        });
        run_exit_callbacks();
        run_exit_callbacks();
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_abi_handshake() {
        assert!(acquire_interface(0xdead_beef).is_err());
        let iface = acquire_interface(ABI_VERSION).unwrap();
        assert!((iface.create_shard)("Const").is_ok());
    }

    #[test]
    #[serial]
    fn test_validate_set_param() {
        let shard = create_shard("Math.Add").unwrap();
        assert!(validate_set_param(shard.as_ref(), 0, &Value::Int(3)).is_ok());
        assert!(validate_set_param(shard.as_ref(), 0, &Value::string("x")).is_err());
        assert!(matches!(
            validate_set_param(shard.as_ref(), 7, &Value::Int(3)),
            Err(RuntimeError::InvalidParameterIndex { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_enum_and_object_registration() {
        register_enum_type(EnumTypeInfo {
            vendor_id: 0x7766,
            type_id: 1,
            name: "RunWireMode",
            labels: vec!["Inline", "Detached", "Stepped"],
        });
        let info = find_enum_type(0x7766, 1).unwrap();
        assert_eq!(info.labels.len(), 3);

        register_object_type(ObjectTypeInfo { vendor_id: 0x7766, type_id: 2, name: "Canvas" });
        assert_eq!(find_object_type(0x7766, 2).unwrap().name, "Canvas");
        assert!(find_object_type(0x7766, 99).is_none());
    }
}
