//! Validated programs and their entry point
//!
//! The front end hands the runtime a [`Program`]: a bag of top-level items
//! plus the behaviour compiled for `Main.main`. [`Program::entry_point`]
//! re-checks the fixed entry signature (a `Main` class with a `main`
//! method, no generics, no parameters, unit return) and produces the
//! diagnostic for whatever is wrong. The scheduler only ever starts from a
//! successfully extracted [`EntryPoint`]; it performs no entry-point error
//! handling of its own.

use std::fmt;

use crate::runtime::cown::BehaviourCtx;
use crate::Error;

/// The behaviour compiled for an entry method.
pub type EntryFn = Box<dyn FnOnce(&mut BehaviourCtx<'_>) + Send>;

/// Kinds of top-level item a program may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Class,
    Interface,
    Function,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::Class => write!(f, "class"),
            ItemKind::Interface => write!(f, "interface"),
            ItemKind::Function => write!(f, "function"),
        }
    }
}

/// A method on a class, as the front end describes it.
pub struct MethodDef {
    pub name: String,
    pub type_params: usize,
    pub params: usize,
    pub returns_unit: bool,
    /// Compiled behaviour; `None` for declarations without a body.
    pub body: Option<EntryFn>,
}

impl MethodDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_params: 0,
            params: 0,
            returns_unit: true,
            body: None,
        }
    }

    pub fn with_body(mut self, body: EntryFn) -> Self {
        self.body = Some(body);
        self
    }
}

impl fmt::Debug for MethodDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDef")
            .field("name", &self.name)
            .field("type_params", &self.type_params)
            .field("params", &self.params)
            .field("returns_unit", &self.returns_unit)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// A top-level item.
#[derive(Debug)]
pub struct ClassDef {
    pub name: String,
    pub kind: ItemKind,
    pub type_params: usize,
    pub methods: Vec<MethodDef>,
}

impl ClassDef {
    pub fn new(name: impl Into<String>, kind: ItemKind) -> Self {
        Self {
            name: name.into(),
            kind,
            type_params: 0,
            methods: Vec::new(),
        }
    }

    pub fn with_method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    fn method(&self, name: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Entry-point diagnostics, reported before any scheduler starts.
#[derive(Debug, Error)]
pub enum EntryPointError {
    #[error("no `Main` class found")]
    MissingMainClass,
    #[error("`Main` must be a class, found a {0}")]
    MainNotAClass(ItemKind),
    #[error("`Main` class must not take type parameters")]
    GenericMainClass,
    #[error("`Main` class has no `main` method")]
    MissingMainMethod,
    #[error("`Main.main` must not take type parameters")]
    GenericMainMethod,
    #[error("`Main.main` must take no parameters and return unit")]
    MalformedSignature { params: usize, returns_unit: bool },
    #[error("`Main.main` has no body")]
    MissingMainBody,
}

/// A validated program as produced by the front end.
#[derive(Debug, Default)]
pub struct Program {
    pub items: Vec<ClassDef>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_item(mut self, item: ClassDef) -> Self {
        self.items.push(item);
        self
    }

    /// Extract the entry point, checking the fixed `Main.main` signature.
    /// Consumes the program; the entry behaviour moves into the result.
    pub fn entry_point(mut self) -> Result<EntryPoint, EntryPointError> {
        let pos = self
            .items
            .iter()
            .position(|c| c.name == "Main")
            .ok_or(EntryPointError::MissingMainClass)?;
        let main = &self.items[pos];
        if main.kind != ItemKind::Class {
            return Err(EntryPointError::MainNotAClass(main.kind));
        }
        if main.type_params != 0 {
            return Err(EntryPointError::GenericMainClass);
        }
        let method = main
            .method("main")
            .ok_or(EntryPointError::MissingMainMethod)?;
        if method.type_params != 0 {
            return Err(EntryPointError::GenericMainMethod);
        }
        if method.params != 0 || !method.returns_unit {
            return Err(EntryPointError::MalformedSignature {
                params: method.params,
                returns_unit: method.returns_unit,
            });
        }
        if method.body.is_none() {
            return Err(EntryPointError::MissingMainBody);
        }

        let mut main = self.items.swap_remove(pos);
        let slot = main
            .methods
            .iter_mut()
            .find(|m| m.name == "main")
            .and_then(|m| m.body.take());
        // Checked non-empty above.
        match slot {
            Some(body) => Ok(EntryPoint {
                name: "Main.main".to_string(),
                body,
            }),
            None => Err(EntryPointError::MissingMainBody),
        }
    }
}

/// A validated entry point, ready to hand to the scheduler.
pub struct EntryPoint {
    name: String,
    body: EntryFn,
}

impl EntryPoint {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn into_body(self) -> EntryFn {
        self.body
    }
}

impl fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryPoint")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
