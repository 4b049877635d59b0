use rustc_hash::FxHashMap;

/// Where a resolved name lives relative to the currently compiling scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    Global,
    Local,
    Builtin,
    Free,
    /// The symbol a function literal is bound to, visible inside its own
    /// body for recursive self-reference.
    Function,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub scope: SymbolScope,
    pub index: usize,
}

/// One lexical scope of name bindings. Function bodies push a table whose
/// `outer` points at the enclosing scope; `resolve` walks outward and
/// promotes any outer local it crosses into a free variable of every scope
/// in between.
pub struct SymbolTable {
    outer: Option<Box<SymbolTable>>,
    store: FxHashMap<String, Symbol>,
    num_definitions: usize,
    pub free_symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable {
            outer: None,
            store: FxHashMap::default(),
            num_definitions: 0,
            free_symbols: Vec::new(),
        }
    }

    pub fn new_enclosed(outer: SymbolTable) -> Self {
        SymbolTable {
            outer: Some(Box::new(outer)),
            store: FxHashMap::default(),
            num_definitions: 0,
            free_symbols: Vec::new(),
        }
    }

    /// Pops one level of nesting back off, handing the outer table back to
    /// the caller. Panics if called on the outermost table — the compiler
    /// must never pop past global scope.
    pub fn pop(self) -> SymbolTable {
        *self.outer.expect("popped outermost symbol table")
    }

    pub fn is_global(&self) -> bool {
        self.outer.is_none()
    }

    pub fn num_definitions(&self) -> usize {
        self.num_definitions
    }

    pub fn define(&mut self, name: &str) -> Symbol {
        let scope = if self.outer.is_none() { SymbolScope::Global } else { SymbolScope::Local };
        let symbol = Symbol { name: name.to_string(), scope, index: self.num_definitions };
        self.store.insert(name.to_string(), symbol.clone());
        self.num_definitions += 1;
        symbol
    }

    pub fn define_builtin(&mut self, index: usize, name: &str) -> Symbol {
        let symbol = Symbol { name: name.to_string(), scope: SymbolScope::Builtin, index };
        self.store.insert(name.to_string(), symbol.clone());
        symbol
    }

    pub fn define_function_name(&mut self, name: &str) -> Symbol {
        let symbol = Symbol { name: name.to_string(), scope: SymbolScope::Function, index: 0 };
        self.store.insert(name.to_string(), symbol.clone());
        symbol
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

    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        if let Some(sym) = self.store.get(name) {
            return Some(sym.clone());
        }
        let outer = self.outer.as_mut()?;
        let sym = outer.resolve(name)?;
        match sym.scope {
            SymbolScope::Global | SymbolScope::Builtin => Some(sym),
            _ => Some(self.define_free(sym)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_global() {
        let mut table = SymbolTable::new();
        let a = table.define("a");
        assert_eq!(a, Symbol { name: "a".into(), scope: SymbolScope::Global, index: 0 });
        let b = table.define("b");
        assert_eq!(b, Symbol { name: "b".into(), scope: SymbolScope::Global, index: 1 });
    }

    #[test]
    fn test_resolve_global() {
        let mut table = SymbolTable::new();
        table.define("a");
        table.define("b");
        assert_eq!(table.resolve("a").unwrap().scope, SymbolScope::Global);
        assert_eq!(table.resolve("b").unwrap().index, 1);
    }

    #[test]
    fn test_resolve_local_shadows_global() {
        let mut global = SymbolTable::new();
        global.define("a");
        let mut local = SymbolTable::new_enclosed(global);
        local.define("a");
        let sym = local.resolve("a").unwrap();
        assert_eq!(sym.scope, SymbolScope::Local);
        assert_eq!(sym.index, 0);
    }

    #[test]
    fn test_resolve_free_variable_promotion() {
        let mut global = SymbolTable::new();
        global.define("a");
        let mut first = SymbolTable::new_enclosed(global);
        first.define("b");
        let mut second = SymbolTable::new_enclosed(first);
        second.define("c");

        // `a` is global: crosses scopes unchanged.
        assert_eq!(second.resolve("a").unwrap().scope, SymbolScope::Global);
        // `b` is local to `first`: promoted to Free in `second`.
        let b = second.resolve("b").unwrap();
        assert_eq!(b.scope, SymbolScope::Free);
        assert_eq!(b.index, 0);
        assert_eq!(second.free_symbols.len(), 1);
        assert_eq!(second.free_symbols[0].name, "b");
        // `c` is local to `second` itself.
        assert_eq!(second.resolve("c").unwrap().scope, SymbolScope::Local);
    }

    #[test]
    fn test_resolve_builtin_unaffected_by_nesting() {
        let mut global = SymbolTable::new();
        global.define_builtin(0, "len");
        let mut local = SymbolTable::new_enclosed(global);
        let sym = local.resolve("len").unwrap();
        assert_eq!(sym.scope, SymbolScope::Builtin);
        assert_eq!(sym.index, 0);
    }

    #[test]
    fn test_resolve_unknown_is_none() {
        let mut table = SymbolTable::new();
        assert!(table.resolve("missing").is_none());
    }

    #[test]
    fn test_define_function_name() {
        let mut table = SymbolTable::new();
        let sym = table.define_function_name("fact");
        assert_eq!(sym.scope, SymbolScope::Function);
        assert_eq!(table.resolve("fact").unwrap().scope, SymbolScope::Function);
    }

    #[test]
    fn test_pop_returns_outer() {
        let global = SymbolTable::new();
        let local = SymbolTable::new_enclosed(global);
        let back = local.pop();
        assert!(back.is_global());
    }
}
