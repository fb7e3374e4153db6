/// Module resolution and loading.
///
/// `require "path"` resolves relative to the configured search root and runs
/// the file once per resolved path; later requires of the same module are
/// no-ops. Dotted namespace references map to `<root>/Foo/Bar/Baz.kes` (or a
/// directory of that name holding an `index.kes`), loaded on demand when a
/// `using` walks into a namespace that is not in the registry yet.

use std::path::{Path, PathBuf};

use crate::errors::KesError;
use crate::object::ObjData;
use crate::value::Value;
use crate::vm::{RunResult, Vm, EXC_IO, EXC_TYPE};

pub const SOURCE_EXTENSION: &str = "kes";

/// Resolves a `require` path against the search root, appending the source
/// extension when the path has none.
pub fn resolve_module_path(root: &str, spec: &str) -> PathBuf {
    let mut path = Path::new(root).join(spec);
    if path.extension().is_none() {
        path.set_extension(SOURCE_EXTENSION);
    }
    path
}

/// Resolves a dotted namespace (`Foo.Bar.Baz`) to a source file:
/// `<root>/Foo/Bar/Baz.kes`, falling back to `<root>/Foo/Bar/Baz/index.kes`.
pub fn resolve_dotted_path(root: &str, dotted: &str) -> Option<PathBuf> {
    let mut base = PathBuf::from(root);
    for segment in dotted.split('.') {
        base.push(segment);
    }
    let mut file = base.clone();
    file.set_extension(SOURCE_EXTENSION);
    if file.is_file() {
        return Some(file);
    }
    let index = base.join(format!("index.{}", SOURCE_EXTENSION));
    if index.is_file() {
        return Some(index);
    }
    None
}

/// REQUIRE: loads and runs the module at the popped path value.
pub fn require(vm: &mut Vm, path_value: Value) -> RunResult<()> {
    let spec = match path_value {
        Value::Obj(id) => match vm.heap.data(id) {
            ObjData::Str(s) => s.chars.to_string(),
            _ => {
                return vm.throw_named(EXC_TYPE, "Required path must be a string.".to_string())
            }
        },
        _ => return vm.throw_named(EXC_TYPE, "Required path must be a string.".to_string()),
    };
    let path = resolve_module_path(&vm.conf.path, &spec);
    load_file(vm, &path)
}

/// Loads a namespace's backing file when the registry misses, so `using
/// Foo.Bar.Baz` can pull modules in by dotted name.
pub fn load_namespace(vm: &mut Vm, dotted: &str) -> RunResult<bool> {
    let Some(path) = resolve_dotted_path(&vm.conf.path.clone(), dotted) else {
        return Ok(false);
    };
    load_file(vm, &path)?;
    Ok(true)
}

fn load_file(vm: &mut Vm, path: &Path) -> RunResult<()> {
    let key = path.to_string_lossy().to_string();
    if vm.modules.contains_key(&key) {
        return Ok(());
    }

    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            return vm.throw_named(
                EXC_IO,
                format!("Cannot load module '{}': {}.", path.display(), e),
            )
        }
    };

    let module = vm.new_module(&key);
    let saved_namespace = vm.current_namespace;
    let saved_module = vm.current_module;
    vm.current_module = module;

    let result = vm.compile_in_module(&source, module);

    match result {
        Ok(function) => {
            // Run the module body; exceptions it throws propagate into the
            // requiring frame unchanged.
            let run = vm.execute_module_raw(function, module).map(|_| ());
            vm.current_module = saved_module;
            vm.current_namespace = saved_namespace;
            run
        }
        Err(KesError::Compile(errors)) => {
            vm.current_module = saved_module;
            vm.current_namespace = saved_namespace;
            let joined = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            vm.throw_named(
                EXC_IO,
                format!("Module '{}' failed to compile: {}", path.display(), joined),
            )
        }
        Err(KesError::Runtime(fatal)) => {
            vm.current_module = saved_module;
            vm.current_namespace = saved_namespace;
            vm.throw_named(
                EXC_IO,
                format!("Module '{}' failed: {}", path.display(), fatal.message),
            )
        }
        Err(KesError::Io(message)) => {
            vm.current_module = saved_module;
            vm.current_namespace = saved_namespace;
            vm.throw_named(EXC_IO, message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_appends_extension() {
        let path = resolve_module_path(".", "lib/util");
        assert_eq!(path, PathBuf::from("./lib/util.kes"));
    }

    #[test]
    fn test_resolve_keeps_existing_extension() {
        let path = resolve_module_path("/src", "main.kes");
        assert_eq!(path, PathBuf::from("/src/main.kes"));
    }

    #[test]
    fn test_dotted_resolution_misses_cleanly() {
        assert!(resolve_dotted_path("/nonexistent", "Foo.Bar").is_none());
    }
}
