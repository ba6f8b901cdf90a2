use std::collections::HashMap;

use crate::bytecode::compile_error::CompileError;
use crate::runtime::builtins::Builtin;

/// Where a symbol's value lives at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    /// Slot in the VM's global array.
    Global,
    /// Slot relative to the current frame's base pointer.
    Local,
    /// Index into the builtin table.
    Builtin,
    /// Index into the running closure's captured values.
    Free,
    /// The function currently being defined, for self-reference.
    Function,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub scope: SymbolScope,
    pub index: usize,
}

/// Index of a scope record in a `SymbolTable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeId(usize);

#[derive(Debug, Clone, Default)]
struct Scope {
    parent: Option<ScopeId>,
    store: HashMap<String, Symbol>,
    num_definitions: usize,
    /// Symbols captured from enclosing scopes, in the order they were first
    /// resolved. The i-th entry is the outer symbol behind `Free` index i.
    free_symbols: Vec<Symbol>,
    function_name: Option<Symbol>,
}

/// Arena of lexical scopes.
///
/// Scope 0 is the root (globals); every other scope records its parent by
/// index. Builtins are shared by the whole table and are seeded once.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
    builtins: HashMap<String, Symbol>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    /// A table with an empty root scope and no builtins.
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope::default()],
            builtins: HashMap::new(),
        }
    }

    /// A table whose root is seeded with every builtin, in table order.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        for builtin in Builtin::ALL {
            table.define_builtin(builtin.index(), builtin.name());
        }
        table
    }

    pub fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    /// Open a new scope enclosed by `parent`.
    pub fn child(&mut self, parent: ScopeId) -> ScopeId {
        self.scopes.push(Scope {
            parent: Some(parent),
            ..Scope::default()
        });
        ScopeId(self.scopes.len() - 1)
    }

    /// Declare `name` in `scope`: a global at the root, a local elsewhere.
    pub fn define(&mut self, scope: ScopeId, name: &str) -> Result<Symbol, CompileError> {
        if self.builtins.contains_key(name) {
            return Err(CompileError::AssignToBuiltin(name.to_string()));
        }

        let record = &mut self.scopes[scope.0];
        match record.store.get(name).map(|s| s.scope) {
            Some(SymbolScope::Free) => return Err(CompileError::ShadowsCapture(name.to_string())),
            Some(_) => return Err(CompileError::Redeclared(name.to_string())),
            None => {}
        }

        let symbol = Symbol {
            name: name.to_string(),
            scope: if record.parent.is_none() {
                SymbolScope::Global
            } else {
                SymbolScope::Local
            },
            index: record.num_definitions,
        };
        record.num_definitions += 1;
        record.store.insert(name.to_string(), symbol.clone());

        Ok(symbol)
    }

    pub fn define_builtin(&mut self, index: usize, name: &str) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Builtin,
            index,
        };
        self.builtins.insert(name.to_string(), symbol.clone());
        symbol
    }

    /// Bind the name of the function whose body `scope` is.
    ///
    /// Own definitions (parameters, lets) shadow it.
    pub fn define_function_name(&mut self, scope: ScopeId, name: &str) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Function,
            index: 0,
        };
        self.scopes[scope.0].function_name = Some(symbol.clone());
        symbol
    }

    /// Look `name` up through the scope chain.
    ///
    /// A hit in an enclosing function (anything but a global or builtin) is
    /// recorded as a free variable in every scope between the hit and
    /// `scope`, and the `Free` symbol is returned.
    pub fn resolve(&mut self, scope: ScopeId, name: &str) -> Option<Symbol> {
        let record = &self.scopes[scope.0];
        if let Some(symbol) = record.store.get(name) {
            return Some(symbol.clone());
        }
        if let Some(symbol) = self.builtins.get(name) {
            return Some(symbol.clone());
        }
        if let Some(symbol) = record.function_name.as_ref().filter(|s| s.name == name) {
            return Some(symbol.clone());
        }

        let parent = record.parent?;
        let outer = self.resolve(parent, name)?;

        match outer.scope {
            SymbolScope::Global | SymbolScope::Builtin => Some(outer),
            _ => Some(self.define_free(scope, outer)),
        }
    }

    fn define_free(&mut self, scope: ScopeId, original: Symbol) -> Symbol {
        let record = &mut self.scopes[scope.0];
        record.free_symbols.push(original.clone());

        let symbol = Symbol {
            name: original.name,
            scope: SymbolScope::Free,
            index: record.free_symbols.len() - 1,
        };
        record.store.insert(symbol.name.clone(), symbol.clone());
        symbol
    }

    pub fn num_definitions(&self, scope: ScopeId) -> usize {
        self.scopes[scope.0].num_definitions
    }

    pub fn free_symbols(&self, scope: ScopeId) -> &[Symbol] {
        &self.scopes[scope.0].free_symbols
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sym(name: &str, scope: SymbolScope, index: usize) -> Symbol {
        Symbol {
            name: name.to_string(),
            scope,
            index,
        }
    }

    #[test]
    fn test_define_global_and_local() {
        let mut table = SymbolTable::new();
        let root = table.root();
        assert_eq!(table.define(root, "a").unwrap(), sym("a", SymbolScope::Global, 0));
        assert_eq!(table.define(root, "b").unwrap(), sym("b", SymbolScope::Global, 1));

        let first = table.child(root);
        assert_eq!(table.define(first, "c").unwrap(), sym("c", SymbolScope::Local, 0));
        assert_eq!(table.define(first, "d").unwrap(), sym("d", SymbolScope::Local, 1));

        let second = table.child(first);
        assert_eq!(table.define(second, "e").unwrap(), sym("e", SymbolScope::Local, 0));
        assert_eq!(table.num_definitions(first), 2);
        assert_eq!(table.num_definitions(second), 1);
    }

    #[test]
    fn test_redeclaration_in_same_scope() {
        let mut table = SymbolTable::new();
        let root = table.root();
        table.define(root, "a").unwrap();
        assert!(matches!(
            table.define(root, "a"),
            Err(CompileError::Redeclared(name)) if name == "a"
        ));

        // a new scope may reuse the name
        let inner = table.child(root);
        assert_eq!(table.define(inner, "a").unwrap(), sym("a", SymbolScope::Local, 0));
    }

    #[test]
    fn test_local_after_capture_of_same_name() {
        let mut table = SymbolTable::new();
        let root = table.root();
        let outer = table.child(root);
        table.define(outer, "a").unwrap();

        let inner = table.child(outer);
        assert_eq!(table.resolve(inner, "a"), Some(sym("a", SymbolScope::Free, 0)));
        assert_eq!(
            table.define(inner, "a"),
            Err(CompileError::ShadowsCapture("a".to_string()))
        );
    }

    #[test]
    fn test_cannot_define_builtin_name() {
        let mut table = SymbolTable::with_builtins();
        let root = table.root();
        let inner = table.child(root);
        assert!(matches!(
            table.define(inner, "len"),
            Err(CompileError::AssignToBuiltin(_))
        ));
    }

    #[test]
    fn test_resolve_builtins_at_every_depth() {
        let mut table = SymbolTable::with_builtins();
        let root = table.root();
        let first = table.child(root);
        let second = table.child(first);

        for (i, builtin) in Builtin::ALL.iter().enumerate() {
            let expected = sym(builtin.name(), SymbolScope::Builtin, i);
            assert_eq!(table.resolve(root, builtin.name()), Some(expected.clone()));
            assert_eq!(table.resolve(second, builtin.name()), Some(expected));
        }
        assert!(table.free_symbols(second).is_empty());
    }

    #[test]
    fn test_globals_are_never_captured() {
        let mut table = SymbolTable::new();
        let root = table.root();
        table.define(root, "g").unwrap();
        let inner = table.child(root);

        assert_eq!(table.resolve(inner, "g"), Some(sym("g", SymbolScope::Global, 0)));
        assert!(table.free_symbols(inner).is_empty());
    }

    #[test]
    fn test_resolve_free_through_intermediate_scopes() {
        let mut table = SymbolTable::new();
        let root = table.root();
        table.define(root, "a").unwrap();

        let first = table.child(root);
        table.define(first, "c").unwrap();

        let second = table.child(first);
        table.define(second, "e").unwrap();

        let third = table.child(second);
        table.define(third, "f").unwrap();

        assert_eq!(table.resolve(third, "a"), Some(sym("a", SymbolScope::Global, 0)));
        assert_eq!(table.resolve(third, "c"), Some(sym("c", SymbolScope::Free, 0)));
        assert_eq!(table.resolve(third, "e"), Some(sym("e", SymbolScope::Free, 1)));
        assert_eq!(table.resolve(third, "f"), Some(sym("f", SymbolScope::Local, 0)));

        // `c` was promoted in the intermediate scope too
        assert_eq!(table.free_symbols(second), &[sym("c", SymbolScope::Local, 0)]);
        assert_eq!(
            table.free_symbols(third),
            &[sym("c", SymbolScope::Free, 0), sym("e", SymbolScope::Local, 0)]
        );

        // resolving again reuses the existing free slot
        assert_eq!(table.resolve(third, "c"), Some(sym("c", SymbolScope::Free, 0)));
        assert_eq!(table.free_symbols(third).len(), 2);
    }

    #[test]
    fn test_unresolvable() {
        let mut table = SymbolTable::new();
        let root = table.root();
        let inner = table.child(root);
        assert_eq!(table.resolve(inner, "nope"), None);
        assert!(table.free_symbols(inner).is_empty());
    }

    #[test]
    fn test_function_name_and_shadowing() {
        let mut table = SymbolTable::new();
        let root = table.root();
        let body = table.child(root);
        table.define_function_name(body, "f");

        assert_eq!(table.resolve(body, "f"), Some(sym("f", SymbolScope::Function, 0)));

        table.define(body, "f").unwrap();
        assert_eq!(table.resolve(body, "f"), Some(sym("f", SymbolScope::Local, 0)));
    }

    #[test]
    fn test_function_name_is_captured_by_nested_scopes() {
        let mut table = SymbolTable::new();
        let root = table.root();
        let body = table.child(root);
        table.define_function_name(body, "f");
        let nested = table.child(body);

        assert_eq!(table.resolve(nested, "f"), Some(sym("f", SymbolScope::Free, 0)));
        assert_eq!(table.free_symbols(nested), &[sym("f", SymbolScope::Function, 0)]);
    }
}
