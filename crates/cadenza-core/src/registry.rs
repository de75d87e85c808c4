//! Native module and task function registries.
//!
//! Registries are explicit objects constructed once at process start and
//! shared by reference with the compiler and the engine. Keeping them
//! off global state lets tests build independent registries side by
//! side.

use std::error::Error;
use std::fmt;

use ahash::AHashMap;

use crate::native_module::{NativeModule, NativeModuleUid};
use crate::task_function::{InputShape, TaskFunction, TaskFunctionUid, TaskMapping};

#[derive(Debug, Clone)]
pub enum RegistryError {
    DuplicateModule(NativeModuleUid),
    DuplicateModuleName(&'static str),
    DuplicateTaskFunction(TaskFunctionUid),
    /// A mapping names a task function that was never registered.
    UnknownTaskFunction(TaskFunctionUid),
}

impl Error for RegistryError {}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateModule(uid) => {
                write!(f, "native module {uid:?} is already registered")
            }
            Self::DuplicateModuleName(name) => {
                write!(f, "native module name \"{name}\" is already registered")
            }
            Self::DuplicateTaskFunction(uid) => {
                write!(f, "task function {uid:?} is already registered")
            }
            Self::UnknownTaskFunction(uid) => {
                write!(f, "mapping refers to unregistered task function {uid:?}")
            }
        }
    }
}

/// Table of native modules, looked up by UID or by name.
#[derive(Debug, Default)]
pub struct NativeModuleRegistry {
    modules: AHashMap<NativeModuleUid, NativeModule>,
    by_name: AHashMap<&'static str, NativeModuleUid>,
}

impl NativeModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: NativeModule) -> Result<(), RegistryError> {
        if self.modules.contains_key(&module.uid) {
            return Err(RegistryError::DuplicateModule(module.uid));
        }
        if self.by_name.contains_key(module.name) {
            return Err(RegistryError::DuplicateModuleName(module.name));
        }

        self.by_name.insert(module.name, module.uid);
        self.modules.insert(module.uid, module);
        Ok(())
    }

    pub fn get(&self, uid: NativeModuleUid) -> Option<&NativeModule> {
        self.modules.get(&uid)
    }

    /// Name lookup, used by compiler frontends while building the AST.
    pub fn get_by_name(&self, name: &str) -> Option<&NativeModule> {
        self.by_name.get(name).and_then(|uid| self.modules.get(uid))
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Table of task functions plus the native-module mappings they service.
#[derive(Debug, Default)]
pub struct TaskFunctionRegistry {
    functions: AHashMap<TaskFunctionUid, TaskFunction>,
    /// Mapping rules per module, in registration order — the first
    /// matching rule wins, so branchless rules come first.
    mappings: AHashMap<NativeModuleUid, Vec<TaskMapping>>,
}

impl TaskFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_function(&mut self, function: TaskFunction) -> Result<(), RegistryError> {
        if self.functions.contains_key(&function.uid) {
            return Err(RegistryError::DuplicateTaskFunction(function.uid));
        }

        self.functions.insert(function.uid, function);
        Ok(())
    }

    pub fn register_mapping(&mut self, mapping: TaskMapping) -> Result<(), RegistryError> {
        if !self.functions.contains_key(&mapping.task) {
            return Err(RegistryError::UnknownTaskFunction(mapping.task));
        }

        self.mappings.entry(mapping.module).or_default().push(mapping);
        Ok(())
    }

    pub fn get(&self, uid: TaskFunctionUid) -> Option<&TaskFunction> {
        self.functions.get(&uid)
    }

    /// Finds the first mapping for `module` whose input pattern matches
    /// the classified input shapes.
    pub fn find_mapping(
        &self,
        module: NativeModuleUid,
        shapes: &[InputShape],
    ) -> Option<&TaskMapping> {
        self.mappings.get(&module)?.iter().find(|mapping| {
            mapping.input_pattern.len() == shapes.len()
                && mapping
                    .input_pattern
                    .iter()
                    .zip(shapes)
                    .all(|(pattern, &shape)| pattern.matches(shape))
        })
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;

    #[test]
    fn duplicate_module_registration_fails() {
        let mut registry = NativeModuleRegistry::new();

        registry.register(builtin::multiply_module()).unwrap();
        assert!(matches!(
            registry.register(builtin::multiply_module()),
            Err(RegistryError::DuplicateModule(_))
        ));
    }

    #[test]
    fn name_lookup_finds_registered_module() {
        let registry = builtin::native_module_registry();

        let module = registry.get_by_name("multiply").unwrap();
        assert_eq!(module.uid, builtin::modules::MULTIPLY);
        assert!(registry.get_by_name("no_such_module").is_none());
    }

    #[test]
    fn branchless_mapping_wins_over_general() {
        let registry = builtin::task_function_registry();

        let branchless = registry
            .find_mapping(
                builtin::modules::MULTIPLY,
                &[InputShape::BranchlessVariable, InputShape::Variable],
            )
            .unwrap();
        let general = registry
            .find_mapping(
                builtin::modules::MULTIPLY,
                &[InputShape::Variable, InputShape::Variable],
            )
            .unwrap();

        assert_ne!(branchless.task, general.task);

        let function = registry.get(branchless.task).unwrap();
        assert!(function.args[0].unshared);
    }

    #[test]
    fn mapping_against_unknown_function_is_rejected() {
        let mut registry = TaskFunctionRegistry::new();

        let err = registry.register_mapping(TaskMapping {
            module: builtin::modules::ADD,
            input_pattern: vec![],
            task: TaskFunctionUid::new(9, 9),
            arg_to_task_arg: vec![],
        });
        assert!(matches!(err, Err(RegistryError::UnknownTaskFunction(_))));
    }
}
