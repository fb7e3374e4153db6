/// Symbol tables built by the resolver.
///
/// One table per lexical scope, linked to its parent by id. Entries track
/// the declaration category, lifecycle state, slot index, mutability and the
/// defining token, which is enough for the resolver's semantic checks and
/// the unused/never-mutated warnings.

use indexmap::IndexMap;

use crate::lexer::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Class,
    Trait,
    Method,
    Function,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolCategory {
    Local,
    Upvalue,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SymbolState {
    Declared,
    Defined,
    Accessed,
    Modified,
}

#[derive(Debug, Clone)]
pub struct SymbolEntry {
    pub category: SymbolCategory,
    pub state: SymbolState,
    pub index: usize,
    pub is_mutable: bool,
    pub token: Token,
}

#[derive(Debug)]
pub struct SymbolTable {
    pub id: u32,
    pub parent: Option<u32>,
    pub scope: ScopeKind,
    pub depth: u32,
    pub entries: IndexMap<String, SymbolEntry>,
}

/// Arena of every table created for one compilation unit.
#[derive(Debug, Default)]
pub struct SymbolTables {
    pub tables: Vec<SymbolTable>,
}

impl SymbolTables {
    pub fn new() -> Self {
        SymbolTables::default()
    }

    pub fn push(&mut self, parent: Option<u32>, scope: ScopeKind, depth: u32) -> u32 {
        let id = self.tables.len() as u32;
        self.tables.push(SymbolTable {
            id,
            parent,
            scope,
            depth,
            entries: IndexMap::new(),
        });
        id
    }

    #[inline]
    pub fn table(&self, id: u32) -> &SymbolTable {
        &self.tables[id as usize]
    }

    #[inline]
    pub fn table_mut(&mut self, id: u32) -> &mut SymbolTable {
        &mut self.tables[id as usize]
    }

    /// Finds `name` in `table` or any enclosing table, returning the owning
    /// table's id.
    pub fn lookup(&self, table: u32, name: &str) -> Option<(u32, &SymbolEntry)> {
        let mut current = Some(table);
        while let Some(id) = current {
            let t = self.table(id);
            if let Some(entry) = t.entries.get(name) {
                return Some((id, entry));
            }
            current = t.parent;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Token;

    #[test]
    fn test_lookup_walks_parents() {
        let mut tables = SymbolTables::new();
        let module = tables.push(None, ScopeKind::Module, 0);
        let block = tables.push(Some(module), ScopeKind::Block, 1);
        tables.table_mut(module).entries.insert(
            "x".into(),
            SymbolEntry {
                category: SymbolCategory::Global,
                state: SymbolState::Defined,
                index: 0,
                is_mutable: false,
                token: Token::synthetic("x"),
            },
        );
        let (owner, entry) = tables.lookup(block, "x").expect("x resolves");
        assert_eq!(owner, module);
        assert_eq!(entry.category, SymbolCategory::Global);
        assert!(tables.lookup(block, "y").is_none());
    }
}
