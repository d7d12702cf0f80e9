//! Lexically-scoped symbol resolution with free-variable promotion.

use std::collections::HashMap;

use crate::bytecode::builtins::BUILTINS;

/// Where a resolved symbol lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    Global,
    Local,
    /// Captured from an enclosing function.
    Free,
    /// A host builtin, indexed into the builtin registry.
    Builtin,
    /// The currently-compiling function's own name; loads resolve to the
    /// closure executing in the current frame.
    Function,
}

/// A resolved identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub scope: SymbolScope,
    pub index: usize,
}

/// One lexical frame of name bindings, chained to its enclosing frame.
///
/// The root frame defines globals; enclosed frames define locals. Resolving
/// a name that lives in an enclosing function promotes it to a free symbol
/// here, recording the original so closure construction can load it from
/// the directly-enclosing frame.
#[derive(Debug, Default)]
pub struct SymbolTable {
    outer: Option<Box<SymbolTable>>,
    store: HashMap<String, Symbol>,
    pub num_definitions: usize,
    pub free_symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A root table with the builtin registry pre-defined.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        for (index, builtin) in BUILTINS.iter().enumerate() {
            table.define_builtin(index, builtin.name);
        }
        table
    }

    /// Open a nested frame enclosing `outer`.
    pub fn new_enclosed(outer: SymbolTable) -> Self {
        Self {
            outer: Some(Box::new(outer)),
            ..Self::default()
        }
    }

    /// Close this frame, returning the enclosing one.
    pub fn into_outer(self) -> Option<SymbolTable> {
        self.outer.map(|boxed| *boxed)
    }

    pub fn is_global(&self) -> bool {
        self.outer.is_none()
    }

    /// Bind a name in this frame. The index is the frame's running
    /// definition count; globals and locals share the counter.
    pub fn define(&mut self, name: &str) -> Symbol {
        let scope = if self.outer.is_some() {
            SymbolScope::Local
        } else {
            SymbolScope::Global
        };

        let symbol = Symbol {
            name: name.to_string(),
            scope,
            index: self.num_definitions,
        };
        self.store.insert(name.to_string(), symbol.clone());
        self.num_definitions += 1;
        symbol
    }

    /// Bind a builtin at a caller-chosen registry index.
    pub fn define_builtin(&mut self, index: usize, name: &str) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Builtin,
            index,
        };
        self.store.insert(name.to_string(), symbol.clone());
        symbol
    }

    /// Bind the currently-compiling function's own name.
    pub fn define_function_name(&mut self, name: &str) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Function,
            index: 0,
        };
        self.store.insert(name.to_string(), symbol.clone());
        symbol
    }

    /// Resolve a name, searching enclosing frames on a miss.
    ///
    /// A Local or Free symbol found in an enclosing frame is promoted to a
    /// Free symbol of this frame; the cascade records one promotion per
    /// intermediate function boundary, so each closure only ever loads
    /// captures from its directly-enclosing frame.
    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        if let Some(symbol) = self.store.get(name) {
            return Some(symbol.clone());
        }

        let outer = self.outer.as_mut()?;
        let symbol = outer.resolve(name)?;

        match symbol.scope {
            SymbolScope::Global | SymbolScope::Builtin | SymbolScope::Function => Some(symbol),
            SymbolScope::Local | SymbolScope::Free => Some(self.define_free(symbol)),
        }
    }

    fn define_free(&mut self, original: Symbol) -> Symbol {
        self.free_symbols.push(original.clone());

        let symbol = Symbol {
            name: original.name,
            scope: SymbolScope::Free,
            index: self.free_symbols.len() - 1,
        };
        self.store.insert(symbol.name.clone(), symbol.clone());
        symbol
    }
}
