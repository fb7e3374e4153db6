/// Abstract syntax tree.
///
/// Nodes live in an arena owned by `Ast`; `AstId` indices keep parent links
/// non-owning. Every node carries its category, a specific kind tag, the
/// token it grew from, a modifier bitfield, its children, and the symbol
/// table the resolver attaches to scope-introducing nodes.

use crate::lexer::Token;

pub type AstId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AstCategory {
    Program,
    Expr,
    Stmt,
    Decl,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AstKind {
    Program,

    // Expressions
    ExprAnd,
    ExprOr,
    ExprArray,
    ExprAssign,
    ExprAwait,
    ExprBinary,
    ExprCall,
    ExprOptionalCall,
    ExprClass,
    ExprTrait,
    ExprDictionary,
    ExprFunction,
    ExprGrouping,
    ExprInterpolation,
    ExprInvoke,
    ExprOptionalInvoke,
    ExprLiteral,
    ExprNilCoalescing,
    ExprElvis,
    ExprTernary,
    ExprParam,
    ExprPropertyGet,
    ExprPropertySet,
    ExprPropertyGetOptional,
    ExprSubscriptGet,
    ExprSubscriptSet,
    ExprSubscriptGetOptional,
    ExprSuperGet,
    ExprSuperInvoke,
    ExprThis,
    ExprUnary,
    ExprVariable,
    ExprYield,
    ExprYieldFrom,

    // Statements
    StmtAwait,
    StmtBlock,
    StmtBreak,
    StmtCase,
    StmtContinue,
    StmtDefault,
    StmtExpression,
    StmtFor,
    StmtIf,
    StmtRequire,
    StmtReturn,
    StmtSwitch,
    StmtThrow,
    StmtTry,
    StmtUsing,
    StmtWhile,
    StmtYield,
    StmtYieldFrom,

    // Declarations
    DeclClass,
    DeclFun,
    DeclMethod,
    DeclField,
    DeclNamespace,
    DeclTrait,
    DeclVar,

    // Structural helpers
    ParamList,
    ArgList,
    StmtList,
    CaseList,
    IdentList,
    TraitList,
    ClassBody,
    CatchClause,
    FinallyClause,
    VarName,
}

impl AstKind {
    pub fn category(self) -> AstCategory {
        use AstKind::*;
        match self {
            Program => AstCategory::Program,
            ExprAnd | ExprOr | ExprArray | ExprAssign | ExprAwait | ExprBinary | ExprCall
            | ExprOptionalCall | ExprClass | ExprTrait | ExprDictionary | ExprFunction
            | ExprGrouping | ExprInterpolation | ExprInvoke | ExprOptionalInvoke
            | ExprLiteral | ExprNilCoalescing | ExprElvis | ExprTernary | ExprParam
            | ExprPropertyGet | ExprPropertySet | ExprPropertyGetOptional | ExprSubscriptGet
            | ExprSubscriptSet | ExprSubscriptGetOptional | ExprSuperGet | ExprSuperInvoke
            | ExprThis | ExprUnary | ExprVariable | ExprYield | ExprYieldFrom => {
                AstCategory::Expr
            }
            StmtAwait | StmtBlock | StmtBreak | StmtCase | StmtContinue | StmtDefault
            | StmtExpression | StmtFor | StmtIf | StmtRequire | StmtReturn | StmtSwitch
            | StmtThrow | StmtTry | StmtUsing | StmtWhile | StmtYield | StmtYieldFrom => {
                AstCategory::Stmt
            }
            DeclClass | DeclFun | DeclMethod | DeclField | DeclNamespace | DeclTrait
            | DeclVar => AstCategory::Decl,
            ParamList | ArgList | StmtList | CaseList | IdentList | TraitList | ClassBody
            | CatchClause | FinallyClause | VarName => AstCategory::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub is_mutable: bool,
    pub is_async: bool,
    pub is_class: bool,
    pub is_initializer: bool,
    pub is_lambda: bool,
    pub is_variadic: bool,
}

#[derive(Debug, Clone)]
pub struct AstNode {
    pub category: AstCategory,
    pub kind: AstKind,
    pub token: Token,
    pub modifiers: Modifiers,
    pub parent: Option<AstId>,
    pub children: Vec<AstId>,
    /// Filled by the resolver for scope-introducing nodes.
    pub symtab: Option<u32>,
}

#[derive(Debug, Default)]
pub struct Ast {
    pub nodes: Vec<AstNode>,
    pub root: AstId,
}

impl Ast {
    pub fn new() -> Ast {
        Ast::default()
    }

    pub fn add(
        &mut self,
        kind: AstKind,
        token: Token,
        modifiers: Modifiers,
        children: Vec<AstId>,
    ) -> AstId {
        let id = self.nodes.len() as AstId;
        self.nodes.push(AstNode {
            category: kind.category(),
            kind,
            token,
            modifiers,
            parent: None,
            children: children.clone(),
            symtab: None,
        });
        for child in children {
            self.nodes[child as usize].parent = Some(id);
        }
        id
    }

    #[inline]
    pub fn node(&self, id: AstId) -> &AstNode {
        &self.nodes[id as usize]
    }

    #[inline]
    pub fn node_mut(&mut self, id: AstId) -> &mut AstNode {
        &mut self.nodes[id as usize]
    }

    pub fn child(&self, id: AstId, index: usize) -> AstId {
        self.nodes[id as usize].children[index]
    }

    pub fn child_count(&self, id: AstId) -> usize {
        self.nodes[id as usize].children.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Token;

    #[test]
    fn test_add_links_parents() {
        let mut ast = Ast::new();
        let leaf = ast.add(
            AstKind::ExprLiteral,
            Token::synthetic("1"),
            Modifiers::default(),
            vec![],
        );
        let root = ast.add(
            AstKind::Program,
            Token::synthetic(""),
            Modifiers::default(),
            vec![leaf],
        );
        assert_eq!(ast.node(leaf).parent, Some(root));
        assert_eq!(ast.node(root).category, AstCategory::Program);
        assert_eq!(ast.node(leaf).category, AstCategory::Expr);
    }
}
