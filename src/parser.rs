/// Prism parser.
///
/// Recursive descent for declarations and statements; precedence climbing
/// for expressions. Errors never abort the parse: on an unexpected token the
/// parser records the error, enters panic mode, and `synchronize()` skips to
/// the next statement boundary. Arrow functions are disambiguated from
/// parenthesized expressions by a trial parse with a saved position.

use crate::ast::*;
use crate::errors::{ParseError, Span};
use crate::lexer::{InterpPart, Lexer, Token};

pub struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    pub errors: Vec<ParseError>,
    panic_mode: bool,
    /// Doc comment / annotations waiting for the next declaration.
    pending_doc: Option<String>,
    pending_annotations: Vec<Annotation>,
}

impl Parser {
    pub fn new(source: &str, source_id: u32) -> (Self, Vec<crate::errors::LexError>) {
        let mut lexer = Lexer::new(source, source_id);
        let tokens = lexer.tokenize();
        (
            Parser {
                tokens,
                pos: 0,
                errors: Vec::new(),
                panic_mode: false,
                pending_doc: None,
                pending_annotations: Vec::new(),
            },
            lexer.errors,
        )
    }

    // ── Token helpers ────────────────────────────────────────────────────────

    fn peek_token(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].0
    }

    fn peek_nth(&self, n: usize) -> &Token {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)].0
    }

    fn current_span(&self) -> Span {
        self.tokens[self.pos.min(self.tokens.len() - 1)].1
    }

    fn prev_span(&self) -> Span {
        self.tokens[self.pos.saturating_sub(1).min(self.tokens.len() - 1)].1
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek_token(), Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos.min(self.tokens.len() - 1)].0.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, tok: &Token) -> bool {
        self.peek_token() == tok
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.check(tok) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, tok: Token, expected: &str) -> Result<Span, ParseError> {
        if self.check(&tok) {
            let span = self.current_span();
            self.advance();
            Ok(span)
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn consume_ident(&mut self, context: &str) -> Result<(String, Span), ParseError> {
        match self.peek_token().clone() {
            Token::Ident(name) => {
                let span = self.current_span();
                self.advance();
                Ok((name, span))
            }
            _ => Err(self.unexpected(context)),
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        if self.is_at_end() {
            ParseError::UnexpectedEof { context: expected.to_string(), span: self.current_span() }
        } else {
            ParseError::UnexpectedToken {
                expected: expected.to_string(),
                found: self.peek_token().describe(),
                span: self.current_span(),
            }
        }
    }

    fn report(&mut self, err: ParseError) {
        if !self.panic_mode {
            self.errors.push(err);
        }
        self.panic_mode = true;
    }

    /// Skip to the next statement-level boundary and leave panic mode.
    fn synchronize(&mut self) {
        while !self.is_at_end() {
            if matches!(self.peek_token(), Token::Semicolon) {
                self.advance();
                break;
            }
            if matches!(
                self.peek_token(),
                Token::Class
                    | Token::Interface
                    | Token::Enum
                    | Token::Function
                    | Token::If
                    | Token::Switch
                    | Token::Match
                    | Token::For
                    | Token::Foreach
                    | Token::While
                    | Token::Do
                    | Token::Return
                    | Token::Try
                    | Token::Throw
                    | Token::Echo
                    | Token::RBrace
            ) {
                break;
            }
            self.advance();
        }
        self.panic_mode = false;
    }

    // ── File ─────────────────────────────────────────────────────────────────

    pub fn parse_file(&mut self) -> File {
        let mut file = File::default();

        if self.check(&Token::Namespace) {
            match self.parse_namespace() {
                Ok(ns) => file.namespace = Some(ns),
                Err(e) => {
                    self.report(e);
                    self.synchronize();
                }
            }
        }

        while self.check(&Token::Use) {
            match self.parse_use() {
                Ok(u) => file.uses.push(u),
                Err(e) => {
                    self.report(e);
                    self.synchronize();
                }
            }
        }

        while !self.is_at_end() {
            let before = self.pos;
            self.collect_meta();
            if self.is_at_end() {
                break;
            }
            if self.starts_declaration() {
                match self.parse_decl() {
                    Ok(decl) => file.decls.push(decl),
                    Err(e) => {
                        self.report(e);
                        self.synchronize();
                    }
                }
            } else {
                self.discard_meta();
                match self.parse_stmt() {
                    Ok(stmt) => file.stmts.push(stmt),
                    Err(e) => {
                        self.report(e);
                        self.synchronize();
                    }
                }
            }
            // Recovery must always make progress, even when the offending
            // token is itself a synchronization boundary.
            if self.pos == before {
                self.advance();
            }
        }

        file
    }

    fn parse_namespace(&mut self) -> Result<String, ParseError> {
        self.consume(Token::Namespace, "'namespace'")?;
        let mut path = String::new();
        loop {
            let (seg, _) = self.consume_ident("namespace segment")?;
            if !path.is_empty() {
                path.push('.');
            }
            path.push_str(&seg);
            if !self.eat(&Token::Dot) {
                break;
            }
        }
        self.consume(Token::Semicolon, "';' after namespace")?;
        Ok(path)
    }

    fn parse_use(&mut self) -> Result<UseDecl, ParseError> {
        let start = self.consume(Token::Use, "'use'")?;
        let mut path = Vec::new();
        loop {
            let (seg, _) = self.consume_ident("import path segment")?;
            path.push(seg);
            if !self.eat(&Token::Dot) {
                break;
            }
        }
        self.consume(Token::Semicolon, "';' after use")?;
        Ok(UseDecl { path, span: start.merge(self.prev_span()) })
    }

    /// Absorb doc comments and `@annotations` preceding a declaration.
    fn collect_meta(&mut self) {
        loop {
            match self.peek_token().clone() {
                Token::DocComment(text) => {
                    self.advance();
                    self.pending_doc = Some(text);
                }
                Token::At => {
                    match self.parse_annotation() {
                        Ok(ann) => self.pending_annotations.push(ann),
                        Err(e) => {
                            self.report(e);
                            self.synchronize();
                            return;
                        }
                    }
                }
                _ => return,
            }
        }
    }

    fn discard_meta(&mut self) {
        self.pending_doc = None;
        self.pending_annotations.clear();
    }

    fn take_meta(&mut self) -> (Option<String>, Vec<Annotation>) {
        (self.pending_doc.take(), std::mem::take(&mut self.pending_annotations))
    }

    fn parse_annotation(&mut self) -> Result<Annotation, ParseError> {
        let start = self.consume(Token::At, "'@'")?;
        let (name, _) = self.consume_ident("annotation name")?;
        let mut args = Vec::new();
        if self.eat(&Token::LParen) {
            while !self.check(&Token::RParen) && !self.is_at_end() {
                args.push(self.parse_expr()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.consume(Token::RParen, "')' after annotation arguments")?;
        }
        Ok(Annotation { name, args, span: start.merge(self.prev_span()) })
    }

    fn starts_declaration(&self) -> bool {
        match self.peek_token() {
            Token::Class | Token::Interface | Token::Enum | Token::Type | Token::NewType => true,
            Token::Abstract | Token::Final => {
                matches!(self.peek_nth(1), Token::Class | Token::Abstract | Token::Final)
            }
            // `function name(` is a declaration; `function (` is a closure.
            Token::Function => matches!(self.peek_nth(1), Token::Ident(_)),
            _ => false,
        }
    }

    // ── Declarations ─────────────────────────────────────────────────────────

    fn parse_decl(&mut self) -> Result<Decl, ParseError> {
        let mut is_abstract = false;
        let mut is_final = false;
        while matches!(self.peek_token(), Token::Abstract | Token::Final) {
            match self.advance() {
                Token::Abstract => is_abstract = true,
                Token::Final => is_final = true,
                _ => unreachable!(),
            }
        }

        match self.peek_token() {
            Token::Class => self.parse_class(is_abstract, is_final).map(Decl::Class),
            Token::Interface => self.parse_interface().map(Decl::Interface),
            Token::Enum => self.parse_enum().map(Decl::Enum),
            Token::Function => {
                let f = self.parse_function_decl(Visibility::Public, false, false, false)?;
                Ok(Decl::Function(f))
            }
            Token::Type => {
                let start = self.current_span();
                self.advance();
                let (name, _) = self.consume_ident("type alias name")?;
                self.consume(Token::Assign, "'=' in type alias")?;
                let target = self.parse_type()?;
                self.consume(Token::Semicolon, "';' after type alias")?;
                Ok(Decl::TypeAlias { name, target, span: start.merge(self.prev_span()) })
            }
            Token::NewType => {
                let start = self.current_span();
                self.advance();
                let (name, _) = self.consume_ident("newtype name")?;
                self.consume(Token::Assign, "'=' in newtype")?;
                let base = self.parse_type()?;
                self.consume(Token::Semicolon, "';' after newtype")?;
                Ok(Decl::NewType { name, base, span: start.merge(self.prev_span()) })
            }
            _ => Err(self.unexpected("declaration")),
        }
    }

    fn parse_class(&mut self, is_abstract: bool, is_final: bool) -> Result<ClassDecl, ParseError> {
        let (doc, annotations) = self.take_meta();
        let start = self.consume(Token::Class, "'class'")?;
        let (name, _) = self.consume_ident("class name")?;

        let parent = if self.eat(&Token::Extends) {
            Some(self.consume_ident("parent class name")?.0)
        } else {
            None
        };

        let mut interfaces = Vec::new();
        if self.eat(&Token::Implements) {
            loop {
                interfaces.push(self.consume_ident("interface name")?.0);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }

        self.consume(Token::LBrace, "'{' to open class body")?;
        let mut consts = Vec::new();
        let mut props = Vec::new();
        let mut methods = Vec::new();

        while !self.check(&Token::RBrace) && !self.is_at_end() {
            let before = self.pos;
            self.collect_meta();
            if self.check(&Token::RBrace) {
                break;
            }
            match self.parse_class_member() {
                Ok(ClassMember::Const(c)) => consts.push(c),
                Ok(ClassMember::Prop(p)) => props.push(p),
                Ok(ClassMember::Method(m)) => methods.push(m),
                Err(e) => {
                    self.report(e);
                    self.synchronize();
                    if self.pos == before {
                        self.advance();
                    }
                }
            }
        }
        self.consume(Token::RBrace, "'}' to close class body")?;

        Ok(ClassDecl {
            name,
            parent,
            interfaces,
            is_abstract,
            is_final,
            consts,
            props,
            methods,
            annotations,
            doc,
            span: start.merge(self.prev_span()),
        })
    }

    fn parse_class_member(&mut self) -> Result<ClassMember, ParseError> {
        let mut visibility = Visibility::Public;
        let mut is_static = false;
        let mut is_abstract = false;
        let mut is_final = false;

        loop {
            match self.peek_token() {
                Token::Public => {
                    self.advance();
                    visibility = Visibility::Public;
                }
                Token::Protected => {
                    self.advance();
                    visibility = Visibility::Protected;
                }
                Token::Private => {
                    self.advance();
                    visibility = Visibility::Private;
                }
                Token::Static => {
                    self.advance();
                    is_static = true;
                }
                Token::Abstract => {
                    self.advance();
                    is_abstract = true;
                }
                Token::Final => {
                    self.advance();
                    is_final = true;
                }
                _ => break,
            }
        }

        if self.check(&Token::Const) {
            let c = self.parse_const_decl()?;
            return Ok(ClassMember::Const(c));
        }

        if self.check(&Token::Function) {
            let m = self.parse_function_decl(visibility, is_static, is_abstract, is_final)?;
            return Ok(ClassMember::Method(m));
        }

        // Property: `<type> $name [= default];`
        let (doc, annotations) = self.take_meta();
        let start = self.current_span();
        let ty = self.parse_type()?;
        let name = match self.peek_token().clone() {
            Token::Variable(n) => {
                self.advance();
                n
            }
            _ => return Err(self.unexpected("property variable after type")),
        };
        let default = if self.eat(&Token::Assign) { Some(self.parse_expr()?) } else { None };
        self.consume(Token::Semicolon, "';' after property")?;
        Ok(ClassMember::Prop(PropDecl {
            name,
            ty,
            default,
            is_static,
            visibility,
            annotations,
            doc,
            span: start.merge(self.prev_span()),
        }))
    }

    fn parse_const_decl(&mut self) -> Result<ConstDecl, ParseError> {
        let start = self.consume(Token::Const, "'const'")?;
        // Optional type between `const` and the name.
        let save = self.pos;
        let ty = match self.parse_type() {
            Ok(t) if matches!(self.peek_token(), Token::Ident(_)) => Some(t),
            _ => {
                self.pos = save;
                None
            }
        };
        let (name, _) = self.consume_ident("constant name")?;
        self.consume(Token::Assign, "'=' in constant")?;
        let value = self.parse_expr()?;
        self.consume(Token::Semicolon, "';' after constant")?;
        Ok(ConstDecl { name, ty, value, span: start.merge(self.prev_span()) })
    }

    fn parse_interface(&mut self) -> Result<InterfaceDecl, ParseError> {
        let (doc, annotations) = self.take_meta();
        let start = self.consume(Token::Interface, "'interface'")?;
        let (name, _) = self.consume_ident("interface name")?;

        let mut extends = Vec::new();
        if self.eat(&Token::Extends) {
            loop {
                extends.push(self.consume_ident("interface name")?.0);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }

        self.consume(Token::LBrace, "'{' to open interface body")?;
        let mut consts = Vec::new();
        let mut methods = Vec::new();
        while !self.check(&Token::RBrace) && !self.is_at_end() {
            self.collect_meta();
            if self.check(&Token::RBrace) {
                break;
            }
            if self.check(&Token::Const) {
                consts.push(self.parse_const_decl()?);
                continue;
            }
            let mut m = self.parse_function_signature(Visibility::Public)?;
            m.is_abstract = true;
            self.consume(Token::Semicolon, "';' after interface method")?;
            methods.push(m);
        }
        self.consume(Token::RBrace, "'}' to close interface body")?;

        Ok(InterfaceDecl {
            name,
            extends,
            consts,
            methods,
            annotations,
            doc,
            span: start.merge(self.prev_span()),
        })
    }

    fn parse_enum(&mut self) -> Result<EnumDecl, ParseError> {
        let (doc, annotations) = self.take_meta();
        let start = self.consume(Token::Enum, "'enum'")?;
        let (name, _) = self.consume_ident("enum name")?;
        let underlying = if self.eat(&Token::Colon) { Some(self.parse_type()?) } else { None };

        self.consume(Token::LBrace, "'{' to open enum body")?;
        let mut cases = Vec::new();
        while !self.check(&Token::RBrace) && !self.is_at_end() {
            let cstart = self.current_span();
            let (cname, _) = self.consume_ident("enum case name")?;
            let value = if self.eat(&Token::Assign) { Some(self.parse_expr()?) } else { None };
            cases.push(EnumCase { name: cname, value, span: cstart.merge(self.prev_span()) });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.consume(Token::RBrace, "'}' to close enum body")?;

        Ok(EnumDecl {
            name,
            underlying,
            cases,
            annotations,
            doc,
            span: start.merge(self.prev_span()),
        })
    }

    /// `function name(params): ret` with no body requirement.
    fn parse_function_signature(&mut self, visibility: Visibility) -> Result<FunctionDecl, ParseError> {
        let (doc, annotations) = self.take_meta();
        let start = self.consume(Token::Function, "'function'")?;
        let (name, _) = self.consume_ident("function name")?;
        self.consume(Token::LParen, "'(' after function name")?;
        let params = self.parse_param_list()?;
        self.consume(Token::RParen, "')' after parameters")?;
        let ret = self.parse_return_types()?;
        Ok(FunctionDecl {
            name,
            params,
            ret,
            body: None,
            is_static: false,
            is_abstract: false,
            is_final: false,
            visibility,
            annotations,
            doc,
            span: start.merge(self.prev_span()),
        })
    }

    fn parse_function_decl(
        &mut self,
        visibility: Visibility,
        is_static: bool,
        is_abstract: bool,
        is_final: bool,
    ) -> Result<FunctionDecl, ParseError> {
        let mut f = self.parse_function_signature(visibility)?;
        f.is_static = is_static;
        f.is_abstract = is_abstract;
        f.is_final = is_final;
        if is_abstract {
            self.consume(Token::Semicolon, "';' after abstract method")?;
        } else {
            f.body = Some(self.parse_block()?);
        }
        f.span = f.span.merge(self.prev_span());
        Ok(f)
    }

    fn parse_param_list(&mut self) -> Result<Vec<Param>, ParseError> {
        let mut params = Vec::new();
        while !self.check(&Token::RParen) && !self.is_at_end() {
            params.push(self.parse_param()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(params)
    }

    fn parse_param(&mut self) -> Result<Param, ParseError> {
        let start = self.current_span();
        let ty = self.parse_type()?;
        let variadic = self.eat(&Token::Ellipsis);
        let name = match self.peek_token().clone() {
            Token::Variable(n) => {
                self.advance();
                n
            }
            _ => return Err(self.unexpected("parameter variable")),
        };
        let default = if self.eat(&Token::Assign) { Some(self.parse_expr()?) } else { None };
        Ok(Param { name, ty, default, variadic, span: start.merge(self.prev_span()) })
    }

    /// `: T`, `: (T1, T2)`, or nothing (void).
    fn parse_return_types(&mut self) -> Result<Vec<TypeNode>, ParseError> {
        if !self.eat(&Token::Colon) {
            return Ok(Vec::new());
        }
        if self.eat(&Token::LParen) {
            let mut types = Vec::new();
            loop {
                let t = self.parse_type()?;
                if matches!(&t, TypeNode::Simple { name, .. } if name == "void") {
                    return Err(ParseError::VoidInTuple { span: t.span() });
                }
                types.push(t);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.consume(Token::RParen, "')' after return types")?;
            Ok(types)
        } else {
            let t = self.parse_type()?;
            if matches!(&t, TypeNode::Simple { name, .. } if name == "void") {
                Ok(Vec::new())
            } else {
                Ok(vec![t])
            }
        }
    }

    // ── Types ────────────────────────────────────────────────────────────────

    pub fn parse_type(&mut self) -> Result<TypeNode, ParseError> {
        let mut ty = self.parse_type_atom()?;
        // Union: `A | B | C`
        if self.check(&Token::Pipe) {
            let span = ty.span();
            let mut members = vec![ty];
            while self.eat(&Token::Pipe) {
                members.push(self.parse_type_atom()?);
            }
            ty = TypeNode::Union(members, span);
        }
        Ok(ty)
    }

    fn parse_type_atom(&mut self) -> Result<TypeNode, ParseError> {
        let span = self.current_span();

        if self.eat(&Token::Question) {
            let inner = self.parse_type_atom()?;
            return Ok(self.with_array_suffix(TypeNode::Nullable(Box::new(inner)))?);
        }

        let base = match self.peek_token().clone() {
            Token::TyInt => {
                self.advance();
                TypeNode::simple("int", span)
            }
            Token::TyFloat => {
                self.advance();
                TypeNode::simple("float", span)
            }
            Token::TyBool => {
                self.advance();
                TypeNode::simple("bool", span)
            }
            Token::TyString => {
                self.advance();
                TypeNode::simple("string", span)
            }
            Token::TyBytes => {
                self.advance();
                TypeNode::simple("bytes", span)
            }
            Token::TyVoid => {
                self.advance();
                TypeNode::simple("void", span)
            }
            Token::TyMap => {
                self.advance();
                self.consume(Token::LBracket, "'[' after 'map'")?;
                let key = self.parse_type()?;
                self.consume(Token::RBracket, "']' after map key type")?;
                let value = self.parse_type_atom()?;
                TypeNode::Map {
                    key: Box::new(key),
                    value: Box::new(value),
                    span: span.merge(self.prev_span()),
                }
            }
            Token::Function => {
                self.advance();
                self.consume(Token::LParen, "'(' in function type")?;
                let mut params = Vec::new();
                while !self.check(&Token::RParen) && !self.is_at_end() {
                    params.push(self.parse_type()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.consume(Token::RParen, "')' in function type")?;
                let ret = if self.eat(&Token::Colon) {
                    self.parse_type_atom()?
                } else {
                    TypeNode::simple("void", span)
                };
                TypeNode::Function {
                    params,
                    ret: Box::new(ret),
                    span: span.merge(self.prev_span()),
                }
            }
            Token::Ident(name) => {
                self.advance();
                // Generic surface syntax: `Foo<T, U>` — parsed, then erased.
                if self.check(&Token::Lt) && self.generic_args_ahead() {
                    self.advance();
                    let mut args = Vec::new();
                    loop {
                        args.push(self.parse_type()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.consume(Token::Gt, "'>' after type arguments")?;
                    TypeNode::Generic { base: name, args, span: span.merge(self.prev_span()) }
                } else {
                    TypeNode::Simple { name, span }
                }
            }
            _ => return Err(self.unexpected("type")),
        };

        self.with_array_suffix(base)
    }

    /// `T[]`, `T[4]`, possibly stacked (`int[][]`).
    fn with_array_suffix(&mut self, mut ty: TypeNode) -> Result<TypeNode, ParseError> {
        while self.check(&Token::LBracket) {
            // `map[...]` key syntax never reaches here; only suffix positions do.
            let span = self.current_span();
            self.advance();
            let len = match self.peek_token().clone() {
                Token::Int(n) if n >= 0 => {
                    self.advance();
                    Some(n as usize)
                }
                _ => None,
            };
            self.consume(Token::RBracket, "']' in array type")?;
            ty = TypeNode::Array { elem: Box::new(ty), len, span };
        }
        Ok(ty)
    }

    /// Heuristic lookahead: does `<` here open a type-argument list?
    fn generic_args_ahead(&self) -> bool {
        let mut i = 1;
        let mut depth = 1;
        while depth > 0 {
            match self.peek_nth(i) {
                Token::Lt => depth += 1,
                Token::Gt => depth -= 1,
                Token::Ident(_)
                | Token::Comma
                | Token::Question
                | Token::TyInt
                | Token::TyFloat
                | Token::TyBool
                | Token::TyString
                | Token::TyBytes
                | Token::LBracket
                | Token::RBracket
                | Token::TyMap => {}
                _ => return false,
            }
            i += 1;
            if i > 32 {
                return false;
            }
        }
        true
    }

    // ── Statements ───────────────────────────────────────────────────────────

    pub fn parse_block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.consume(Token::LBrace, "'{' to open block")?;
        let mut stmts = Vec::new();
        while !self.check(&Token::RBrace) && !self.is_at_end() {
            let before = self.pos;
            match self.parse_stmt() {
                Ok(s) => stmts.push(s),
                Err(e) => {
                    self.report(e);
                    self.synchronize();
                    if self.pos == before {
                        self.advance();
                    }
                }
            }
        }
        self.consume(Token::RBrace, "'}' to close block")?;
        Ok(stmts)
    }

    pub fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        match self.peek_token() {
            Token::LBrace if !self.super_array_ahead() => {
                let start = self.current_span();
                let body = self.parse_block()?;
                Ok(Stmt::Block(body, start.merge(self.prev_span())))
            }
            Token::If => self.parse_if(),
            Token::Switch => self.parse_switch_stmt(),
            Token::For => self.parse_for(),
            Token::Foreach => self.parse_foreach(),
            Token::While => self.parse_while(),
            Token::Do => self.parse_do_while(),
            Token::Break => {
                let span = self.current_span();
                self.advance();
                self.consume(Token::Semicolon, "';' after break")?;
                Ok(Stmt::Break(span))
            }
            Token::Continue => {
                let span = self.current_span();
                self.advance();
                self.consume(Token::Semicolon, "';' after continue")?;
                Ok(Stmt::Continue(span))
            }
            Token::Return => self.parse_return(),
            Token::Try => self.parse_try(),
            Token::Throw => {
                let start = self.current_span();
                self.advance();
                let value = self.parse_expr()?;
                self.consume(Token::Semicolon, "';' after throw")?;
                Ok(Stmt::Throw { value, span: start.merge(self.prev_span()) })
            }
            Token::Echo => {
                let start = self.current_span();
                self.advance();
                let value = self.parse_expr()?;
                self.consume(Token::Semicolon, "';' after echo")?;
                Ok(Stmt::Echo { value, span: start.merge(self.prev_span()) })
            }
            _ => self.parse_var_decl_or_expr(),
        }
    }

    /// Distinguish `int $x = …;` / `$x := …;` / multi-binds from plain
    /// expression statements. Typed declarations are found by a trial type
    /// parse with rewind.
    fn parse_var_decl_or_expr(&mut self) -> Result<Stmt, ParseError> {
        let start = self.current_span();

        // `$x := e;` and `$a, $b := f();`
        if matches!(self.peek_token(), Token::Variable(_)) {
            if matches!(self.peek_nth(1), Token::Walrus) {
                let name = match self.advance() {
                    Token::Variable(n) => n,
                    _ => unreachable!(),
                };
                self.advance(); // :=
                let init = self.parse_expr()?;
                self.consume(Token::Semicolon, "';' after declaration")?;
                return Ok(Stmt::VarDecl {
                    ty: None,
                    name,
                    init: Some(init),
                    span: start.merge(self.prev_span()),
                });
            }
            if matches!(self.peek_nth(1), Token::Comma) && self.walrus_multi_ahead() {
                let mut targets = Vec::new();
                loop {
                    match self.advance() {
                        Token::Variable(n) => targets.push((None, n)),
                        _ => return Err(self.unexpected("variable in multi-bind")),
                    }
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.consume(Token::Walrus, "':=' in multi-bind")?;
                let init = self.parse_expr()?;
                self.consume(Token::Semicolon, "';' after declaration")?;
                return Ok(Stmt::MultiVarDecl { targets, init, span: start.merge(self.prev_span()) });
            }
        }

        // Trial: `<type> $name` opens a typed declaration.
        let save = self.pos;
        if self.type_decl_ahead() {
            if let Ok(ty) = self.parse_type() {
                if matches!(self.peek_token(), Token::Variable(_)) {
                    return self.parse_typed_decl_tail(ty, start);
                }
            }
            self.pos = save;
        }

        let expr = self.parse_expr()?;
        self.consume(Token::Semicolon, "';' after expression")?;
        Ok(Stmt::Expr(expr))
    }

    /// Cheap pre-filter before the trial type parse.
    fn type_decl_ahead(&self) -> bool {
        matches!(
            self.peek_token(),
            Token::TyInt
                | Token::TyFloat
                | Token::TyBool
                | Token::TyString
                | Token::TyBytes
                | Token::TyMap
                | Token::Question
                | Token::Function
                | Token::Ident(_)
        )
    }

    fn walrus_multi_ahead(&self) -> bool {
        let mut i = 0;
        loop {
            if !matches!(self.peek_nth(i), Token::Variable(_)) {
                return false;
            }
            match self.peek_nth(i + 1) {
                Token::Comma => i += 2,
                Token::Walrus => return true,
                _ => return false,
            }
        }
    }

    fn parse_typed_decl_tail(&mut self, ty: TypeNode, start: Span) -> Result<Stmt, ParseError> {
        let name = match self.advance() {
            Token::Variable(n) => n,
            _ => unreachable!(),
        };

        // `int $a, string $b = f();`
        if self.check(&Token::Comma) {
            let mut targets = vec![(Some(ty), name)];
            while self.eat(&Token::Comma) {
                let t = self.parse_type()?;
                let n = match self.peek_token().clone() {
                    Token::Variable(n) => {
                        self.advance();
                        n
                    }
                    _ => return Err(self.unexpected("variable in multi-declaration")),
                };
                targets.push((Some(t), n));
            }
            self.consume(Token::Assign, "'=' in multi-declaration")?;
            let init = self.parse_expr()?;
            self.consume(Token::Semicolon, "';' after declaration")?;
            return Ok(Stmt::MultiVarDecl { targets, init, span: start.merge(self.prev_span()) });
        }

        let init = if self.eat(&Token::Assign) { Some(self.parse_expr()?) } else { None };
        self.consume(Token::Semicolon, "';' after declaration")?;
        Ok(Stmt::VarDecl { ty: Some(ty), name, init, span: start.merge(self.prev_span()) })
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let start = self.consume(Token::If, "'if'")?;
        self.consume(Token::LParen, "'(' after if")?;
        let cond = self.parse_expr()?;
        self.consume(Token::RParen, "')' after condition")?;
        let then = self.parse_block()?;

        let mut elseifs = Vec::new();
        let mut else_branch = None;
        loop {
            if self.eat(&Token::Elseif) {
                self.consume(Token::LParen, "'(' after elseif")?;
                let c = self.parse_expr()?;
                self.consume(Token::RParen, "')' after condition")?;
                elseifs.push((c, self.parse_block()?));
            } else if self.eat(&Token::Else) {
                if self.check(&Token::If) {
                    // `else if` sugar for `elseif`
                    self.advance();
                    self.consume(Token::LParen, "'(' after else if")?;
                    let c = self.parse_expr()?;
                    self.consume(Token::RParen, "')' after condition")?;
                    elseifs.push((c, self.parse_block()?));
                } else {
                    else_branch = Some(self.parse_block()?);
                    break;
                }
            } else {
                break;
            }
        }

        Ok(Stmt::If { cond, then, elseifs, else_branch, span: start.merge(self.prev_span()) })
    }

    fn parse_switch_stmt(&mut self) -> Result<Stmt, ParseError> {
        let start = self.consume(Token::Switch, "'switch'")?;
        self.consume(Token::LParen, "'(' after switch")?;
        let subject = self.parse_expr()?;
        self.consume(Token::RParen, "')' after switch subject")?;
        self.consume(Token::LBrace, "'{' to open switch body")?;

        // `=>` form in statement position is the switch expression.
        if !self.check(&Token::Case) && !self.check(&Token::Default) {
            let (arms, default) = self.parse_switch_expr_arms()?;
            self.consume(Token::RBrace, "'}' to close switch")?;
            let span = start.merge(self.prev_span());
            self.consume(Token::Semicolon, "';' after switch expression")?;
            return Ok(Stmt::Expr(Expr::SwitchExpr {
                subject: Box::new(subject),
                arms,
                default,
                span,
            }));
        }

        let mut arms = Vec::new();
        let mut default = None;
        while !self.check(&Token::RBrace) && !self.is_at_end() {
            if self.eat(&Token::Default) {
                self.consume(Token::Colon, "':' after default")?;
                default = Some(self.parse_case_body()?);
            } else {
                let cstart = self.consume(Token::Case, "'case'")?;
                let mut values = vec![self.parse_expr()?];
                while self.eat(&Token::Comma) {
                    values.push(self.parse_expr()?);
                }
                self.consume(Token::Colon, "':' after case values")?;
                let body = self.parse_case_body()?;
                arms.push(SwitchArm { values, body, span: cstart.merge(self.prev_span()) });
            }
        }
        self.consume(Token::RBrace, "'}' to close switch")?;
        Ok(Stmt::Switch { subject, arms, default, span: start.merge(self.prev_span()) })
    }

    /// Statements until the next `case`, `default`, or `}`.
    fn parse_case_body(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut body = Vec::new();
        while !matches!(self.peek_token(), Token::Case | Token::Default | Token::RBrace | Token::Eof) {
            let before = self.pos;
            match self.parse_stmt() {
                Ok(s) => body.push(s),
                Err(e) => {
                    self.report(e);
                    self.synchronize();
                    if self.pos == before {
                        self.advance();
                    }
                }
            }
        }
        Ok(body)
    }

    fn parse_switch_expr_arms(
        &mut self,
    ) -> Result<(Vec<(Vec<Expr>, Expr)>, Option<Box<Expr>>), ParseError> {
        let mut arms = Vec::new();
        let mut default = None;
        while !self.check(&Token::RBrace) && !self.is_at_end() {
            if self.eat(&Token::Default) {
                self.consume(Token::FatArrow, "'=>' after default")?;
                default = Some(Box::new(self.parse_expr()?));
            } else {
                let mut values = vec![self.parse_expr()?];
                while self.eat(&Token::Comma) {
                    values.push(self.parse_expr()?);
                }
                self.consume(Token::FatArrow, "'=>' after case values")?;
                let body = self.parse_expr()?;
                arms.push((values, body));
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok((arms, default))
    }

    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        let start = self.consume(Token::For, "'for'")?;
        self.consume(Token::LParen, "'(' after for")?;

        let init = if self.eat(&Token::Semicolon) {
            None
        } else {
            Some(Box::new(self.parse_var_decl_or_expr()?))
        };

        let cond = if self.check(&Token::Semicolon) { None } else { Some(self.parse_expr()?) };
        self.consume(Token::Semicolon, "';' after loop condition")?;

        let step = if self.check(&Token::RParen) { None } else { Some(self.parse_expr()?) };
        self.consume(Token::RParen, "')' after for clauses")?;

        let body = self.parse_block()?;
        Ok(Stmt::For { init, cond, step, body, span: start.merge(self.prev_span()) })
    }

    fn parse_foreach(&mut self) -> Result<Stmt, ParseError> {
        let start = self.consume(Token::Foreach, "'foreach'")?;
        self.consume(Token::LParen, "'(' after foreach")?;
        let subject = self.parse_expr()?;
        self.consume(Token::As, "'as' in foreach")?;

        let first = match self.peek_token().clone() {
            Token::Variable(n) => {
                self.advance();
                n
            }
            _ => return Err(self.unexpected("loop variable")),
        };

        let (key, value) = if self.eat(&Token::FatArrow) {
            let v = match self.peek_token().clone() {
                Token::Variable(n) => {
                    self.advance();
                    n
                }
                _ => return Err(self.unexpected("value variable after '=>'")),
            };
            (Some(first), v)
        } else {
            (None, first)
        };

        self.consume(Token::RParen, "')' after foreach clauses")?;
        let body = self.parse_block()?;
        Ok(Stmt::Foreach { subject, key, value, body, span: start.merge(self.prev_span()) })
    }

    fn parse_while(&mut self) -> Result<Stmt, ParseError> {
        let start = self.consume(Token::While, "'while'")?;
        self.consume(Token::LParen, "'(' after while")?;
        let cond = self.parse_expr()?;
        self.consume(Token::RParen, "')' after condition")?;
        let body = self.parse_block()?;
        Ok(Stmt::While { cond, body, span: start.merge(self.prev_span()) })
    }

    fn parse_do_while(&mut self) -> Result<Stmt, ParseError> {
        let start = self.consume(Token::Do, "'do'")?;
        let body = self.parse_block()?;
        self.consume(Token::While, "'while' after do block")?;
        self.consume(Token::LParen, "'(' after while")?;
        let cond = self.parse_expr()?;
        self.consume(Token::RParen, "')' after condition")?;
        self.consume(Token::Semicolon, "';' after do-while")?;
        Ok(Stmt::DoWhile { body, cond, span: start.merge(self.prev_span()) })
    }

    fn parse_return(&mut self) -> Result<Stmt, ParseError> {
        let start = self.consume(Token::Return, "'return'")?;
        let mut values = Vec::new();
        if !self.check(&Token::Semicolon) {
            values.push(self.parse_expr()?);
            while self.eat(&Token::Comma) {
                values.push(self.parse_expr()?);
            }
        }
        self.consume(Token::Semicolon, "';' after return")?;
        Ok(Stmt::Return { values, span: start.merge(self.prev_span()) })
    }

    fn parse_try(&mut self) -> Result<Stmt, ParseError> {
        let start = self.consume(Token::Try, "'try'")?;
        let body = self.parse_block()?;

        let mut catches = Vec::new();
        while self.check(&Token::Catch) {
            let cstart = self.current_span();
            self.advance();
            self.consume(Token::LParen, "'(' after catch")?;
            let (class, _) = self.consume_ident("exception class name")?;
            let var = match self.peek_token().clone() {
                Token::Variable(n) => {
                    self.advance();
                    n
                }
                _ => return Err(self.unexpected("catch variable")),
            };
            self.consume(Token::RParen, "')' after catch clause")?;
            let cbody = self.parse_block()?;
            catches.push(CatchClause { class, var, body: cbody, span: cstart.merge(self.prev_span()) });
        }

        let finally = if self.eat(&Token::Finally) { Some(self.parse_block()?) } else { None };

        if catches.is_empty() && finally.is_none() {
            return Err(ParseError::InvalidSyntax {
                context: "try without catch or finally".to_string(),
                span: start,
            });
        }

        Ok(Stmt::Try { body, catches, finally, span: start.merge(self.prev_span()) })
    }

    // ── Expressions (precedence climbing) ────────────────────────────────────

    pub fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Expr, ParseError> {
        let target = self.parse_ternary()?;

        let op = match self.peek_token() {
            Token::Assign => Some(AssignOp::Assign),
            Token::PlusAssign => Some(AssignOp::Add),
            Token::MinusAssign => Some(AssignOp::Sub),
            Token::StarAssign => Some(AssignOp::Mul),
            Token::SlashAssign => Some(AssignOp::Div),
            Token::PercentAssign => Some(AssignOp::Mod),
            _ => None,
        };

        if let Some(op) = op {
            let op_span = self.current_span();
            self.advance();
            if !target.is_assignable() {
                return Err(ParseError::InvalidAssignmentTarget { span: op_span });
            }
            let value = self.parse_assignment()?;
            let span = target.span().merge(value.span());
            return Ok(Expr::Assign {
                target: Box::new(target),
                op,
                value: Box::new(value),
                span,
            });
        }

        Ok(target)
    }

    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_logic_or()?;

        if self.eat(&Token::Question) {
            let then = self.parse_expr()?;
            self.consume(Token::Colon, "':' in ternary")?;
            let otherwise = self.parse_ternary()?;
            let span = cond.span().merge(otherwise.span());
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then: Some(Box::new(then)),
                otherwise: Box::new(otherwise),
                span,
            });
        }
        if self.eat(&Token::Elvis) {
            let otherwise = self.parse_ternary()?;
            let span = cond.span().merge(otherwise.span());
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then: None,
                otherwise: Box::new(otherwise),
                span,
            });
        }

        Ok(cond)
    }

    fn parse_logic_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_logic_and()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.parse_logic_and()?;
            let span = lhs.span().merge(rhs.span());
            lhs = Expr::Binary { op: BinOp::Or, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_logic_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_bit_or()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.parse_bit_or()?;
            let span = lhs.span().merge(rhs.span());
            lhs = Expr::Binary { op: BinOp::And, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_bit_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_bit_xor()?;
        while self.eat(&Token::Pipe) {
            let rhs = self.parse_bit_xor()?;
            let span = lhs.span().merge(rhs.span());
            lhs = Expr::Binary { op: BinOp::BitOr, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_bit_xor(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_bit_and()?;
        while self.eat(&Token::Caret) {
            let rhs = self.parse_bit_and()?;
            let span = lhs.span().merge(rhs.span());
            lhs = Expr::Binary { op: BinOp::BitXor, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_bit_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_equality()?;
        while self.eat(&Token::Amp) {
            let rhs = self.parse_equality()?;
            let span = lhs.span().merge(rhs.span());
            lhs = Expr::Binary { op: BinOp::BitAnd, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = match self.peek_token() {
                Token::EqEq => BinOp::Eq,
                Token::NotEq => BinOp::Ne,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_comparison()?;
            let span = lhs.span().merge(rhs.span());
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_cast()?;
        loop {
            let op = match self.peek_token() {
                Token::Lt => BinOp::Lt,
                Token::LtEq => BinOp::Le,
                Token::Gt => BinOp::Gt,
                Token::GtEq => BinOp::Ge,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_cast()?;
            let span = lhs.span().merge(rhs.span());
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    /// `e as T`, `e as? T`, `e is T`. A second `as` in a row is rejected;
    /// write `(x as A) as B` when the double conversion is intended.
    fn parse_cast(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_shift()?;

        match self.peek_token() {
            Token::As | Token::AsSafe => {
                let safe = matches!(self.peek_token(), Token::AsSafe);
                self.advance();
                let ty = self.parse_type()?;
                let span = expr.span().merge(self.prev_span());
                if matches!(self.peek_token(), Token::As | Token::AsSafe) {
                    return Err(ParseError::ChainedCast { span: self.current_span() });
                }
                Ok(Expr::Cast { expr: Box::new(expr), ty, safe, span })
            }
            Token::Is => {
                self.advance();
                let ty = self.parse_type()?;
                let span = expr.span().merge(self.prev_span());
                Ok(Expr::Is { expr: Box::new(expr), ty, span })
            }
            _ => Ok(expr),
        }
    }

    fn parse_shift(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek_token() {
                Token::Shl => BinOp::Shl,
                Token::Shr => BinOp::Shr,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_additive()?;
            let span = lhs.span().merge(rhs.span());
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_token() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            let span = lhs.span().merge(rhs.span());
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek_token() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            let span = lhs.span().merge(rhs.span());
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let span = self.current_span();
        let op = match self.peek_token() {
            Token::Minus => Some(UnaryOp::Neg),
            Token::Bang => Some(UnaryOp::Not),
            Token::Tilde => Some(UnaryOp::BitNot),
            Token::PlusPlus => Some(UnaryOp::PreInc),
            Token::MinusMinus => Some(UnaryOp::PreDec),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let expr = self.parse_unary()?;
            let span = span.merge(expr.span());
            return Ok(Expr::Unary { op, expr: Box::new(expr), span });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;

        loop {
            match self.peek_token() {
                Token::LParen => {
                    self.advance();
                    let args = self.parse_args()?;
                    let span = expr.span().merge(self.prev_span());
                    expr = match expr {
                        Expr::Ident { name, .. } => {
                            Expr::Call { callee: Callee::Named(name), args, span }
                        }
                        other => Expr::Call { callee: Callee::Expr(Box::new(other)), args, span },
                    };
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.consume(Token::RBracket, "']' after index")?;
                    let span = expr.span().merge(self.prev_span());
                    expr = Expr::Index { obj: Box::new(expr), index: Box::new(index), span };
                }
                Token::Arrow | Token::Dot => {
                    self.advance();
                    let (name, _) = self.consume_ident("member name")?;
                    if self.eat(&Token::LParen) {
                        let args = self.parse_args()?;
                        let span = expr.span().merge(self.prev_span());
                        expr = Expr::MethodCall { obj: Box::new(expr), name, args, span };
                    } else {
                        let span = expr.span().merge(self.prev_span());
                        expr = Expr::Prop { obj: Box::new(expr), name, span };
                    }
                }
                Token::PlusPlus => {
                    self.advance();
                    let span = expr.span().merge(self.prev_span());
                    expr = Expr::Postfix { op: PostfixOp::Inc, expr: Box::new(expr), span };
                }
                Token::MinusMinus => {
                    self.advance();
                    let span = expr.span().merge(self.prev_span());
                    expr = Expr::Postfix { op: PostfixOp::Dec, expr: Box::new(expr), span };
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        while !self.check(&Token::RParen) && !self.is_at_end() {
            args.push(self.parse_expr()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.consume(Token::RParen, "')' after arguments")?;
        Ok(args)
    }

    fn parse_static_tail(&mut self, target: StaticTarget, start: Span) -> Result<Expr, ParseError> {
        // `T::class`
        if self.check(&Token::Class) {
            self.advance();
            return Ok(Expr::ClassRef { target, span: start.merge(self.prev_span()) });
        }
        // `T::$prop`
        if let Token::Variable(name) = self.peek_token().clone() {
            self.advance();
            return Ok(Expr::StaticAccess {
                target,
                member: name,
                is_var: true,
                span: start.merge(self.prev_span()),
            });
        }
        let (member, _) = self.consume_ident("member after '::'")?;
        if self.eat(&Token::LParen) {
            let args = self.parse_args()?;
            return Ok(Expr::StaticCall {
                target,
                method: member,
                args,
                span: start.merge(self.prev_span()),
            });
        }
        Ok(Expr::StaticAccess { target, member, is_var: false, span: start.merge(self.prev_span()) })
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let span = self.current_span();
        match self.peek_token().clone() {
            Token::Null => {
                self.advance();
                Ok(Expr::Null(span))
            }
            Token::True => {
                self.advance();
                Ok(Expr::Bool(true, span))
            }
            Token::False => {
                self.advance();
                Ok(Expr::Bool(false, span))
            }
            Token::Int(n) => {
                self.advance();
                Ok(Expr::Int(n, span))
            }
            Token::Float(f) => {
                self.advance();
                Ok(Expr::Float(f, span))
            }
            Token::Str(s) => {
                self.advance();
                Ok(Expr::Str(s, span))
            }
            Token::InterpStr(parts) => {
                self.advance();
                let parts = parts
                    .into_iter()
                    .map(|p| match p {
                        InterpPart::Lit(s) => InterpSeg::Lit(s),
                        InterpPart::Var(name) => InterpSeg::Var(name, span),
                    })
                    .collect();
                Ok(Expr::Interp { parts, span })
            }
            Token::Variable(name) => {
                self.advance();
                Ok(Expr::Var { name, span })
            }
            Token::This => {
                self.advance();
                Ok(Expr::This(span))
            }
            Token::SelfKw => {
                self.advance();
                self.consume(Token::ColonColon, "'::' after self")?;
                self.parse_static_tail(StaticTarget::SelfKw, span)
            }
            Token::Parent => {
                self.advance();
                self.consume(Token::ColonColon, "'::' after parent")?;
                self.parse_static_tail(StaticTarget::Parent, span)
            }
            Token::New => {
                self.advance();
                let (class, _) = self.consume_ident("class name after new")?;
                // Generic arguments on construction are surface-only.
                if self.check(&Token::Lt) && self.generic_args_ahead() {
                    self.advance();
                    loop {
                        self.parse_type()?;
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.consume(Token::Gt, "'>' after type arguments")?;
                }
                self.consume(Token::LParen, "'(' after class name")?;
                let args = self.parse_args()?;
                Ok(Expr::New { class, args, span: span.merge(self.prev_span()) })
            }
            Token::Function => {
                self.advance();
                self.parse_closure(span)
            }
            Token::Match => {
                self.advance();
                self.parse_match(span)
            }
            Token::Switch => {
                self.advance();
                self.consume(Token::LParen, "'(' after switch")?;
                let subject = self.parse_expr()?;
                self.consume(Token::RParen, "')' after switch subject")?;
                self.consume(Token::LBrace, "'{' to open switch")?;
                let (arms, default) = self.parse_switch_expr_arms()?;
                self.consume(Token::RBrace, "'}' to close switch")?;
                Ok(Expr::SwitchExpr {
                    subject: Box::new(subject),
                    arms,
                    default,
                    span: span.merge(self.prev_span()),
                })
            }
            Token::Ident(name) => {
                self.advance();
                if self.eat(&Token::ColonColon) {
                    return self.parse_static_tail(StaticTarget::Class(name), span);
                }
                Ok(Expr::Ident { name, span })
            }
            Token::LParen => self.parse_paren_or_arrow(span),
            Token::LBracket => {
                self.advance();
                let mut elems = Vec::new();
                while !self.check(&Token::RBracket) && !self.is_at_end() {
                    elems.push(self.parse_expr()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.consume(Token::RBracket, "']' after array literal")?;
                Ok(Expr::ArrayLit { elems, span: span.merge(self.prev_span()) })
            }
            Token::TyMap => {
                self.advance();
                self.consume(Token::LBracket, "'[' after 'map'")?;
                let key_ty = self.parse_type()?;
                self.consume(Token::RBracket, "']' after map key type")?;
                let val_ty = self.parse_type_atom()?;
                self.consume(Token::LBrace, "'{' to open map literal")?;
                let mut entries = Vec::new();
                while !self.check(&Token::RBrace) && !self.is_at_end() {
                    let key = self.parse_expr()?;
                    self.consume(Token::Colon, "':' between map key and value")?;
                    let value = self.parse_expr()?;
                    entries.push((key, value));
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.consume(Token::RBrace, "'}' to close map literal")?;
                Ok(Expr::MapLit { key_ty, val_ty, entries, span: span.merge(self.prev_span()) })
            }
            Token::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                while !self.check(&Token::RBrace) && !self.is_at_end() {
                    let first = self.parse_expr()?;
                    if self.eat(&Token::Colon) {
                        let value = self.parse_expr()?;
                        entries.push((Some(first), value));
                    } else {
                        entries.push((None, first));
                    }
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.consume(Token::RBrace, "'}' to close super-array literal")?;
                Ok(Expr::SuperArrayLit { entries, span: span.merge(self.prev_span()) })
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    /// `(params) => expr` or a parenthesized expression — decided by trial.
    fn parse_paren_or_arrow(&mut self, start: Span) -> Result<Expr, ParseError> {
        let save = self.pos;
        self.advance(); // '('

        // Trial: parameter list, ')', optional ': type', '=>'.
        let trial = (|| -> Result<(Vec<Param>, Option<TypeNode>), ParseError> {
            let params = self.parse_param_list()?;
            self.consume(Token::RParen, "')'")?;
            let ret = if self.eat(&Token::Colon) { Some(self.parse_type()?) } else { None };
            self.consume(Token::FatArrow, "'=>'")?;
            Ok((params, ret))
        })();

        match trial {
            Ok((params, ret)) => {
                let body = self.parse_expr()?;
                let span = start.merge(body.span());
                Ok(Expr::ArrowFn { params, ret, body: Box::new(body), span })
            }
            Err(_) => {
                self.pos = save;
                self.advance(); // '('
                let expr = self.parse_expr()?;
                self.consume(Token::RParen, "')' after expression")?;
                Ok(expr)
            }
        }
    }

    fn parse_closure(&mut self, start: Span) -> Result<Expr, ParseError> {
        self.consume(Token::LParen, "'(' after function")?;
        let params = self.parse_param_list()?;
        self.consume(Token::RParen, "')' after parameters")?;

        let mut uses = Vec::new();
        if self.eat(&Token::Use) {
            self.consume(Token::LParen, "'(' after use")?;
            while !self.check(&Token::RParen) && !self.is_at_end() {
                let uspan = self.current_span();
                match self.peek_token().clone() {
                    Token::Variable(n) => {
                        self.advance();
                        uses.push((n, uspan));
                    }
                    _ => return Err(self.unexpected("captured variable in use clause")),
                }
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.consume(Token::RParen, "')' after use clause")?;
        }

        let ret = self.parse_return_types()?;
        let body = self.parse_block()?;
        Ok(Expr::Closure { params, ret, uses, body, span: start.merge(self.prev_span()) })
    }

    fn parse_match(&mut self, start: Span) -> Result<Expr, ParseError> {
        self.consume(Token::LParen, "'(' after match")?;
        let subject = self.parse_expr()?;
        self.consume(Token::RParen, "')' after match subject")?;
        self.consume(Token::LBrace, "'{' to open match")?;

        let mut arms = Vec::new();
        while !self.check(&Token::RBrace) && !self.is_at_end() {
            let aspan = self.current_span();
            let pattern = self.parse_match_pattern()?;
            let guard = if self.eat(&Token::If) { Some(self.parse_expr()?) } else { None };
            self.consume(Token::FatArrow, "'=>' after match pattern")?;
            let body = self.parse_expr()?;
            arms.push(MatchArm { pattern, guard, body, span: aspan.merge(self.prev_span()) });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.consume(Token::RBrace, "'}' to close match")?;
        Ok(Expr::Match { subject: Box::new(subject), arms, span: start.merge(self.prev_span()) })
    }

    fn parse_match_pattern(&mut self) -> Result<MatchPattern, ParseError> {
        // Wildcard `_`
        if matches!(self.peek_token(), Token::Ident(n) if n == "_") {
            self.advance();
            return Ok(MatchPattern::Wildcard);
        }

        // Type pattern: `<type> $bind` or a bare type followed by `=>`/`if`.
        let save = self.pos;
        if self.type_decl_ahead() {
            if let Ok(ty) = self.parse_type() {
                if let Token::Variable(bind) = self.peek_token().clone() {
                    self.advance();
                    return Ok(MatchPattern::Type { ty, bind: Some(bind) });
                }
                if matches!(self.peek_token(), Token::FatArrow | Token::If)
                    && !matches!(self.tokens[save].0, Token::Ident(_))
                {
                    return Ok(MatchPattern::Type { ty, bind: None });
                }
            }
            self.pos = save;
        }

        let mut values = vec![self.parse_expr()?];
        while self.eat(&Token::Comma) {
            // A trailing comma before `}` ends the arm list, not the values.
            if self.check(&Token::RBrace) {
                break;
            }
            values.push(self.parse_expr()?);
        }
        Ok(MatchPattern::Values(values))
    }

    /// At a `{` in statement position: is this a super-array literal
    /// expression statement rather than a block? A literal immediately
    /// followed by `,`, `:` or `}` cannot start a block.
    fn super_array_ahead(&self) -> bool {
        matches!(
            self.peek_nth(1),
            Token::Int(_) | Token::Float(_) | Token::Str(_)
        ) && matches!(self.peek_nth(2), Token::Comma | Token::Colon | Token::RBrace)
    }
}

enum ClassMember {
    Const(ConstDecl),
    Prop(PropDecl),
    Method(FunctionDecl),
}

/// Convenience: lex + parse a whole source file.
pub fn parse_source(source: &str, source_id: u32) -> (File, Vec<crate::errors::LexError>, Vec<ParseError>) {
    let (mut parser, lex_errors) = Parser::new(source, source_id);
    let file = parser.parse_file();
    let parse_errors = std::mem::take(&mut parser.errors);
    (file, lex_errors, parse_errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> File {
        let (file, lex, parse) = parse_source(src, 0);
        assert!(lex.is_empty(), "lex errors: {:?}", lex);
        assert!(parse.is_empty(), "parse errors: {:?}", parse);
        file
    }

    #[test]
    fn top_level_statement() {
        let f = parse_ok("echo 1 + 2;");
        assert_eq!(f.stmts.len(), 1);
        assert!(matches!(f.stmts[0], Stmt::Echo { .. }));
    }

    #[test]
    fn typed_declaration() {
        let f = parse_ok("int $x = 1;");
        match &f.stmts[0] {
            Stmt::VarDecl { ty: Some(TypeNode::Simple { name, .. }), name: var, .. } => {
                assert_eq!(name, "int");
                assert_eq!(var, "x");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn walrus_declaration() {
        let f = parse_ok("$a := [1, 2, 3];");
        assert!(matches!(&f.stmts[0], Stmt::VarDecl { ty: None, name, .. } if name == "a"));
    }

    #[test]
    fn multi_bind() {
        let f = parse_ok("int $q, int $r = divmod(7, 2);");
        match &f.stmts[0] {
            Stmt::MultiVarDecl { targets, .. } => assert_eq!(targets.len(), 2),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn class_with_members() {
        let f = parse_ok(
            r#"
            class Point extends Base implements Printable {
                public int $x = 0;
                private static string $label = "p";
                const int ORIGIN = 0;
                public function norm(): int { return $this->x; }
            }
            "#,
        );
        match &f.decls[0] {
            Decl::Class(c) => {
                assert_eq!(c.name, "Point");
                assert_eq!(c.parent.as_deref(), Some("Base"));
                assert_eq!(c.interfaces, vec!["Printable".to_string()]);
                assert_eq!(c.props.len(), 2);
                assert_eq!(c.consts.len(), 1);
                assert_eq!(c.methods.len(), 1);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn chained_cast_rejected() {
        let (_, _, errors) = parse_source("$y := $x as int as float;", 0);
        assert!(errors.iter().any(|e| matches!(e, ParseError::ChainedCast { .. })));
    }

    #[test]
    fn invalid_assignment_target_rejected() {
        let (_, _, errors) = parse_source("1 + 2 = 3;", 0);
        assert!(errors.iter().any(|e| matches!(e, ParseError::InvalidAssignmentTarget { .. })));
    }

    #[test]
    fn arrow_function_vs_paren() {
        let f = parse_ok("$f := (int $x) => $x + 1;");
        match &f.stmts[0] {
            Stmt::VarDecl { init: Some(Expr::ArrowFn { params, .. }), .. } => {
                assert_eq!(params.len(), 1);
            }
            other => panic!("unexpected: {:?}", other),
        }
        let f = parse_ok("$g := (1 + 2) * 3;");
        assert!(matches!(&f.stmts[0], Stmt::VarDecl { init: Some(Expr::Binary { .. }), .. }));
    }

    #[test]
    fn match_with_guard_and_wildcard() {
        let f = parse_ok(r#"$m := match (3) { 1 => "a", int $n if $n > 1 => "b", _ => "c" };"#);
        match &f.stmts[0] {
            Stmt::VarDecl { init: Some(Expr::Match { arms, .. }), .. } => {
                assert_eq!(arms.len(), 3);
                assert!(matches!(arms[0].pattern, MatchPattern::Values(_)));
                assert!(matches!(arms[1].pattern, MatchPattern::Type { .. }));
                assert!(arms[1].guard.is_some());
                assert!(matches!(arms[2].pattern, MatchPattern::Wildcard));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn switch_both_forms() {
        let f = parse_ok(
            r#"
            switch ($x) {
                case 1, 2: echo "low"; break;
                default: echo "high";
            }
            "#,
        );
        assert!(matches!(&f.stmts[0], Stmt::Switch { arms, .. } if arms.len() == 1));

        let f = parse_ok(r#"$v := switch ($x) { 1 => "a", default => "z" };"#);
        assert!(matches!(&f.stmts[0], Stmt::VarDecl { init: Some(Expr::SwitchExpr { .. }), .. }));
    }

    #[test]
    fn try_catch_finally() {
        let f = parse_ok(
            r#"
            try { throw new Exception("x"); }
            catch (Exception $e) { echo $e->getMessage(); }
            finally { echo "end"; }
            "#,
        );
        match &f.stmts[0] {
            Stmt::Try { catches, finally, .. } => {
                assert_eq!(catches.len(), 1);
                assert!(finally.is_some());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn foreach_with_key() {
        let f = parse_ok("foreach ($a as $k => $v) { echo $k; }");
        assert!(
            matches!(&f.stmts[0], Stmt::Foreach { key: Some(k), value, .. } if k == "k" && value == "v")
        );
    }

    #[test]
    fn closure_with_use() {
        let f = parse_ok("$f := function (int $x) use ($a, $b): int { return $x; };");
        match &f.stmts[0] {
            Stmt::VarDecl { init: Some(Expr::Closure { uses, params, ret, .. }), .. } => {
                assert_eq!(uses.len(), 2);
                assert_eq!(params.len(), 1);
                assert_eq!(ret.len(), 1);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn recovery_reports_then_continues() {
        let (file, _, errors) = parse_source("int $x = ;\necho 2;", 0);
        assert!(!errors.is_empty());
        // The echo after the bad statement still parses.
        assert!(file.stmts.iter().any(|s| matches!(s, Stmt::Echo { .. })));
    }

    #[test]
    fn namespace_and_use() {
        let f = parse_ok("namespace app.core;\nuse app.util.Strings;\necho 1;");
        assert_eq!(f.namespace.as_deref(), Some("app.core"));
        assert_eq!(f.uses.len(), 1);
        assert_eq!(f.uses[0].path, vec!["app", "util", "Strings"]);
    }

    #[test]
    fn map_and_super_array_literals() {
        let f = parse_ok(r#"$m := map[string]int{"a": 1, "b": 2};"#);
        assert!(matches!(&f.stmts[0], Stmt::VarDecl { init: Some(Expr::MapLit { entries, .. }), .. } if entries.len() == 2));

        let f = parse_ok(r#"$s := { 1, "k": 2 };"#);
        assert!(matches!(&f.stmts[0], Stmt::VarDecl { init: Some(Expr::SuperArrayLit { entries, .. }), .. } if entries.len() == 2));
    }

    #[test]
    fn enum_with_values() {
        let f = parse_ok("enum Color: int { Red = 1, Green, Blue = 4 }");
        match &f.decls[0] {
            Decl::Enum(e) => {
                assert_eq!(e.cases.len(), 3);
                assert!(e.underlying.is_some());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn annotations_attach() {
        let f = parse_ok(r#"@Route("/home") class Home {}"#);
        match &f.decls[0] {
            Decl::Class(c) => {
                assert_eq!(c.annotations.len(), 1);
                assert_eq!(c.annotations[0].name, "Route");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
