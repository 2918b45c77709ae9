//! Análisis semántico.
//!
//! Transforma el AST en un [`Model`]. Esto ocurre en tres pasadas:
//!
//! 1. Declaración de todos los nombres globales (hilos, funciones,
//!    hooks, estáticas globales y símbolos externos), de forma que un
//!    cuerpo pueda referirse a entidades declaradas más adelante.
//! 2. Resolución de cuerpos. Cada hilo, subrutina, función o hook
//!    abre un ámbito propio que se anida sobre el de quien lo contiene.
//!    Las subrutinas pueden llamar a sus hermanas y a las subrutinas de
//!    sus ancestros, nunca a las de otro hilo.
//! 3. Aplicación de sugerencias `use_reg` y `tune` sobre las entidades
//!    ya resueltas.
//!
//! Todos los errores son fatales y se reporta el primero encontrado.

use indexmap::IndexMap;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    error::Warning,
    lex::{Identifier, NoCase},
    model::{
        self, Callee, CoroutineUnit, Expr, ExternId, ExternKind, FlagsRequest, FunctionId, HookId,
        Local, LocalId, Model, Owner, Place, Profile, RegisterClass, RegisterHint, StaticId,
        StaticVariable, Stmt, Tuning, Type, UnitId, UnitKind, Var,
    },
    parse::{self, Item},
    source::{Located, Location},
};

pub type Semantic<T> = Result<T, Located<SemanticError>>;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SemanticError {
    #[error("Name `{0}` is already defined in this scope")]
    DuplicateName(Identifier),

    #[error("Name `{0}` is reserved for generated C symbols")]
    ReservedName(Identifier),

    #[error("Symbol `{0}` is undefined")]
    UnknownReference(String),

    #[error("`{0}` is only allowed inside a thread or subroutine")]
    SuspensionOutsideCoroutine(&'static str),

    #[error("Subroutine `{0}` must be declared inside a thread or another subroutine")]
    SubroutineOutsideThread(Identifier),

    #[error("`{0}` outside of a loop")]
    OutsideLoop(&'static str),

    #[error("`{name}` expects {expected} argument(s), found {found}")]
    ArityMismatch {
        name: Identifier,
        expected: usize,
        found: usize,
    },

    #[error("`{0}` is not a subroutine visible from here")]
    ExpectedSubroutine(Identifier),

    #[error("`{0}` is not a function, use `call` for subroutines")]
    ExpectedFunction(Identifier),

    #[error("`{0}` is not a variable")]
    ExpectedVariable(Identifier),

    #[error("`{0}` is not an array")]
    NotAnArray(Identifier),

    #[error("Array `{0}` must be indexed")]
    ExpectedIndex(Identifier),

    #[error("Initializers must be constant expressions")]
    NotConstant,

    #[error("Arrays cannot have initializers")]
    ArrayInitializer,

    #[error("Array length must be in the range [1, 65535]")]
    BadLength,

    #[error("Entrypoint not found, define a `main {{ ... }}` block")]
    MissingEntry,

    #[error("Only functions with a return type can return a value")]
    UnexpectedReturnValue,

    #[error("Function `{0}` must return a value")]
    MissingReturnValue(Identifier),

    #[error("Function `{0}` does not return a value")]
    VoidValue(Identifier),

    #[error("Unknown tuning directive `{0}`, expected `pure`, `no_inline` or `always_inline`")]
    UnknownTuning(Identifier),

    #[error("Unknown register class `{0}`, expected `low`, `high`, `any` or `rN`")]
    UnknownRegisterClass(Identifier),

    #[error("Unknown flags profile `{0}`, expected `size` or `speed`")]
    UnknownProfile(Identifier),

    #[error("`{0}` cannot carry this kind of hint")]
    BadHintTarget(String),
}

/// Resultado del análisis semántico.
#[derive(Debug)]
pub struct Resolved {
    pub model: Model,
    pub warnings: Vec<Located<Warning>>,
}

impl parse::Ast {
    pub fn resolve(self) -> Semantic<Resolved> {
        let parse::Ast { items, eof } = self;

        let mut resolver = Resolver::default();
        let globals = resolver.scan_global_scope(&items, &eof)?;

        let mut hints = Vec::new();
        for item in items {
            match item {
                Item::Thread(thread) => {
                    let id = match globals.symbols.get(thread.name.as_ref()) {
                        Some(Named::Unit(id)) => *id,
                        _ => continue,
                    };

                    resolver.coroutine(id, thread.body, &globals)?;
                }

                Item::Function(function) => {
                    if let Some(Named::Function(id)) = globals.symbols.get(function.name.as_ref()) {
                        resolver.function(*id, function, &globals)?;
                    }
                }

                Item::Hook(hook) => {
                    if let Some(Named::Hook(id)) = globals.symbols.get(hook.name.as_ref()) {
                        resolver.hook(*id, hook.body, &globals)?;
                    }
                }

                Item::Entry(entry) => resolver.entry(entry.body, &globals)?,

                Item::UseReg(_) | Item::Tune(_) => hints.push(item),

                _ => (),
            }
        }

        for hint in hints {
            match hint {
                Item::UseReg(hint) => resolver.use_reg(hint, &globals)?,
                Item::Tune(tune) => resolver.tune(tune, &globals)?,
                _ => (),
            }
        }

        let entry = resolver
            .entry
            .take()
            .ok_or_else(|| Located::at(SemanticError::MissingEntry, eof.clone()))?;

        let model = Model {
            includes: resolver.includes,
            externs: resolver.externs,
            statics: resolver.statics,
            units: resolver.units,
            functions: resolver.functions,
            hooks: resolver.hooks,
            entry,
            flags: resolver.flags,
        };

        debug!(
            threads = model.threads().count(),
            units = model.units.len(),
            statics = model.statics.len(),
            hooks = model.hooks.len(),
            "declaration model built"
        );

        Ok(Resolved {
            model,
            warnings: resolver.warnings,
        })
    }
}

#[derive(Copy, Clone, Debug)]
enum Named {
    Static(StaticId),
    Local(LocalId),
    Extern(ExternId),
    Function(FunctionId),
    Unit(UnitId),
    Hook(HookId),
}

struct Scope<'a> {
    outer: Option<&'a Scope<'a>>,
    symbols: IndexMap<Identifier, Named>,
}

impl<'a> Scope<'a> {
    fn nested(outer: &'a Scope<'a>) -> Self {
        Scope {
            outer: Some(outer),
            symbols: IndexMap::new(),
        }
    }

    fn lookup(&self, id: &Located<Identifier>) -> Semantic<Named> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            if let Some(named) = current.symbols.get(id.as_ref()) {
                return Ok(*named);
            }

            scope = current.outer;
        }

        Err(Located::at(
            SemanticError::UnknownReference(id.as_ref().to_string()),
            id.location().clone(),
        ))
    }

    fn define(&mut self, id: &Located<Identifier>, named: Named) -> Semantic<()> {
        if is_reserved(id.as_ref().as_ref()) {
            return Err(Located::at(
                SemanticError::ReservedName(id.as_ref().clone()),
                id.location().clone(),
            ));
        }

        match self.symbols.insert(id.as_ref().clone(), named) {
            None => Ok(()),
            Some(_) => Err(Located::at(
                SemanticError::DuplicateName(id.as_ref().clone()),
                id.location().clone(),
            )),
        }
    }
}

/// Prefijos de ruta y de símbolo para los miembros de un ámbito.
struct Prefix {
    path: String,
    symbol: String,
}

impl Prefix {
    fn of(name: &str) -> Self {
        Prefix {
            path: name.to_owned(),
            symbol: name.to_owned(),
        }
    }
}

enum BodyKind {
    Unit,
    Function {
        name: Identifier,
        returns: Option<Type>,
    },
    Other,
}

/// Estado de resolución de un cuerpo en particular.
struct BodyCx {
    kind: BodyKind,
    locals: Vec<Local>,
    loops: u32,
}

impl BodyCx {
    fn new(kind: BodyKind, locals: Vec<Local>) -> Self {
        BodyCx {
            kind,
            locals,
            loops: 0,
        }
    }
}

#[derive(Copy, Clone)]
enum HintTarget {
    Static(StaticId),
    Local(Owner, LocalId),
    Unit(UnitId),
    Function(FunctionId),
    Hook(HookId),
    Extern,
}

#[derive(Default)]
struct Resolver {
    includes: Vec<String>,
    externs: Vec<model::Extern>,
    statics: Vec<StaticVariable>,
    units: Vec<CoroutineUnit>,
    functions: Vec<model::Function>,
    hooks: Vec<model::Hook>,
    entry: Option<model::Entry>,
    flags: Option<FlagsRequest>,
    namespaces: HashMap<Owner, IndexMap<Identifier, Named>>,
    warnings: Vec<Located<Warning>>,
}

impl Resolver {
    fn scan_global_scope(&mut self, items: &[Item], eof: &Location) -> Semantic<Scope<'static>> {
        let mut globals = Scope {
            outer: None,
            symbols: IndexMap::new(),
        };

        let mut entry_location: Option<&Location> = None;
        let mut flags_location: Option<&Location> = None;

        for item in items {
            match item {
                Item::Include(header) => self.includes.push(header.as_ref().clone()),

                Item::Extern(external) => {
                    let id = ExternId(self.externs.len());
                    let kind = match external.kind {
                        parse::ExternKind::Variable { typ, volatile } => {
                            ExternKind::Variable { typ, volatile }
                        }

                        parse::ExternKind::Function => ExternKind::Function,
                    };

                    self.externs.push(model::Extern {
                        name: external.name.as_ref().clone(),
                        kind,
                        location: external.name.location().clone(),
                    });

                    globals.define(&external.name, Named::Extern(id))?;
                }

                Item::Static(decl) => {
                    let id = self.new_static(decl, Owner::Global, None)?;
                    globals.define(&decl.name, Named::Static(id))?;
                }

                Item::Function(function) => {
                    let id = FunctionId(self.functions.len());
                    let locals = function
                        .parameters
                        .iter()
                        .map(|parameter| Local {
                            name: parameter.name.as_ref().clone(),
                            typ: *parameter.of.as_ref(),
                            length: None,
                            hint: None,
                            location: parameter.name.location().clone(),
                        })
                        .collect();

                    self.functions.push(model::Function {
                        name: function.name.as_ref().clone(),
                        parameters: (0..function.parameters.len()).map(LocalId).collect(),
                        returns: function.returns.as_ref().map(|typ| *typ.as_ref()),
                        locals,
                        tuning: Tuning::empty(),
                        body: Vec::new(),
                        location: function.name.location().clone(),
                    });

                    globals.define(&function.name, Named::Function(id))?;
                }

                Item::Thread(thread) => {
                    let name = thread.name.as_ref().as_ref();
                    let id = self.new_unit(
                        &thread.name,
                        UnitKind::Thread,
                        None,
                        &thread.parameters,
                        Prefix::of(name),
                    );

                    globals.define(&thread.name, Named::Unit(id))?;
                }

                Item::Hook(hook) => {
                    let id = HookId(self.hooks.len());
                    self.hooks.push(model::Hook {
                        name: hook.name.as_ref().clone(),
                        kind: hook.kind,
                        locals: Vec::new(),
                        tuning: Tuning::empty(),
                        body: Vec::new(),
                        location: hook.name.location().clone(),
                    });

                    globals.define(&hook.name, Named::Hook(id))?;
                }

                Item::Entry(entry) => {
                    if entry_location.replace(&entry.location).is_some() {
                        return Err(Located::at(
                            SemanticError::DuplicateName(Identifier::new("main")),
                            entry.location.clone(),
                        ));
                    }

                    self.entry = Some(model::Entry {
                        locals: Vec::new(),
                        body: Vec::new(),
                        location: entry.location.clone(),
                    });
                }

                Item::Cflags(cflags) => {
                    if flags_location.replace(cflags.name.location()).is_some() {
                        return Err(Located::at(
                            SemanticError::DuplicateName(Identifier::new("cflags")),
                            cflags.name.location().clone(),
                        ));
                    }

                    let profile = match &cflags.profile {
                        None => Profile::Size,
                        Some(profile) if is(profile, "size") => Profile::Size,
                        Some(profile) if is(profile, "speed") => Profile::Speed,
                        Some(profile) => {
                            return Err(Located::at(
                                SemanticError::UnknownProfile(profile.as_ref().clone()),
                                profile.location().clone(),
                            ))
                        }
                    };

                    self.flags = Some(FlagsRequest {
                        name: cflags.name.as_ref().clone(),
                        profile,
                    });
                }

                Item::UseReg(_) | Item::Tune(_) => (),
            }
        }

        if self.entry.is_none() {
            return Err(Located::at(SemanticError::MissingEntry, eof.clone()));
        }

        trace!(symbols = globals.symbols.len(), "global scope scanned");
        Ok(globals)
    }

    fn new_static(
        &mut self,
        decl: &parse::StaticDecl,
        owner: Owner,
        prefix: Option<&Prefix>,
    ) -> Semantic<StaticId> {
        let length = decl.length.as_ref().map(check_length).transpose()?;
        let typ = *decl.typ.as_ref();

        let initial = match &decl.initial {
            Some(initial) if length.is_some() => {
                return Err(Located::at(
                    SemanticError::ArrayInitializer,
                    initial.location().clone(),
                ))
            }

            Some(initial) => Some(typ.wrap(fold(initial)?)),
            None => None,
        };

        let name = decl.name.as_ref();
        let (path, symbol) = match prefix {
            Some(prefix) => (
                format!("{}.{}", prefix.path, name),
                format!("{}__{}", prefix.symbol, name),
            ),

            None => (name.to_string(), name.to_string()),
        };

        let id = StaticId(self.statics.len());
        self.statics.push(StaticVariable {
            name: name.clone(),
            path,
            symbol,
            owner,
            typ,
            length,
            volatile: decl.volatile,
            initial,
            hint: None,
            location: decl.name.location().clone(),
        });

        Ok(id)
    }

    fn new_unit(
        &mut self,
        name: &Located<Identifier>,
        kind: UnitKind,
        thread: Option<UnitId>,
        parameters: &[parse::Parameter],
        prefix: Prefix,
    ) -> UnitId {
        let id = UnitId(self.units.len());

        let parameters = parameters
            .iter()
            .map(|parameter| {
                let param = StaticId(self.statics.len());
                self.statics.push(StaticVariable {
                    name: parameter.name.as_ref().clone(),
                    path: format!("{}.{}", prefix.path, parameter.name.as_ref()),
                    symbol: format!("{}__{}", prefix.symbol, parameter.name.as_ref()),
                    owner: Owner::Unit(id),
                    typ: *parameter.of.as_ref(),
                    length: None,
                    volatile: false,
                    initial: None,
                    hint: None,
                    location: parameter.name.location().clone(),
                });

                param
            })
            .collect();

        self.units.push(CoroutineUnit {
            name: name.as_ref().clone(),
            path: prefix.path,
            symbol: prefix.symbol,
            kind,
            thread: thread.unwrap_or(id),
            parameters,
            locals: Vec::new(),
            state_hint: None,
            tuning: Tuning::empty(),
            body: Vec::new(),
            location: name.location().clone(),
        });

        id
    }

    fn coroutine(&mut self, id: UnitId, body: parse::Body, outer: &Scope) -> Semantic<()> {
        let mut scope = Scope::nested(outer);
        let prefix = Prefix {
            path: self.units[id.0].path.clone(),
            symbol: self.units[id.0].symbol.clone(),
        };

        for param in self.units[id.0].parameters.clone() {
            let var = &self.statics[param.0];
            let name = Located::at(var.name.clone(), var.location.clone());
            scope.define(&name, Named::Static(param))?;
        }

        for decl in &body.statics {
            let var = self.new_static(decl, Owner::Unit(id), Some(&prefix))?;
            scope.define(&decl.name, Named::Static(var))?;
        }

        let thread = self.units[id.0].thread;

        let mut subroutines = Vec::new();
        for sub in body.subroutines {
            let sub_prefix = Prefix {
                path: format!("{}.{}", prefix.path, sub.name.as_ref()),
                symbol: format!("{}__{}", prefix.symbol, sub.name.as_ref()),
            };

            let kind = UnitKind::Subroutine { parent: id };
            let sub_id = self.new_unit(&sub.name, kind, Some(thread), &sub.parameters, sub_prefix);

            scope.define(&sub.name, Named::Unit(sub_id))?;
            subroutines.push((sub_id, sub.body));
        }

        // Las subrutinas se resuelven antes que las sentencias de este
        // cuerpo, por lo cual no ven sus `let`
        for (sub_id, sub_body) in subroutines {
            self.coroutine(sub_id, sub_body, &scope)?;
        }

        let mut cx = BodyCx::new(BodyKind::Unit, Vec::new());
        let statements = self.block(&mut cx, &mut scope, body.statements)?;

        let unit = &mut self.units[id.0];
        unit.body = statements;
        unit.locals = cx.locals;

        trace!(unit = %unit.path, locals = unit.locals.len(), "coroutine resolved");

        self.namespaces.insert(Owner::Unit(id), scope.symbols);
        Ok(())
    }

    fn function(&mut self, id: FunctionId, function: parse::Function, outer: &Scope) -> Semantic<()> {
        let mut scope = Scope::nested(outer);
        let locals = std::mem::take(&mut self.functions[id.0].locals);

        for (local, parameter) in function.parameters.iter().enumerate() {
            scope.define(&parameter.name, Named::Local(LocalId(local)))?;
        }

        let owner = Owner::Function(id);
        self.scoped_statics(&mut scope, &function.body, owner, function.name.as_ref())?;

        let kind = BodyKind::Function {
            name: function.name.as_ref().clone(),
            returns: function.returns.map(Located::into_inner),
        };

        let mut cx = BodyCx::new(kind, locals);
        let statements = self.block(&mut cx, &mut scope, function.body.statements)?;

        let function = &mut self.functions[id.0];
        function.body = statements;
        function.locals = cx.locals;

        self.namespaces.insert(owner, scope.symbols);
        Ok(())
    }

    fn hook(&mut self, id: HookId, body: parse::Body, outer: &Scope) -> Semantic<()> {
        let mut scope = Scope::nested(outer);
        let name = self.hooks[id.0].name.clone();

        let owner = Owner::Hook(id);
        self.scoped_statics(&mut scope, &body, owner, &name)?;

        let mut cx = BodyCx::new(BodyKind::Other, Vec::new());
        let statements = self.block(&mut cx, &mut scope, body.statements)?;

        let hook = &mut self.hooks[id.0];
        hook.body = statements;
        hook.locals = cx.locals;

        self.namespaces.insert(owner, scope.symbols);
        Ok(())
    }

    fn entry(&mut self, body: parse::Body, outer: &Scope) -> Semantic<()> {
        let mut scope = Scope::nested(outer);
        self.scoped_statics(&mut scope, &body, Owner::Entry, &Identifier::new("main"))?;

        let mut cx = BodyCx::new(BodyKind::Other, Vec::new());
        let statements = self.block(&mut cx, &mut scope, body.statements)?;

        if let Some(entry) = &mut self.entry {
            entry.body = statements;
            entry.locals = cx.locals;
        }

        Ok(())
    }

    /// Estáticas de un cuerpo que no es corrutina, el cual tampoco
    /// admite subrutinas.
    fn scoped_statics(
        &mut self,
        scope: &mut Scope,
        body: &parse::Body,
        owner: Owner,
        name: &Identifier,
    ) -> Semantic<()> {
        if let Some(sub) = body.subroutines.first() {
            return Err(Located::at(
                SemanticError::SubroutineOutsideThread(sub.name.as_ref().clone()),
                sub.name.location().clone(),
            ));
        }

        let prefix = Prefix::of(name.as_ref());
        for decl in &body.statics {
            let var = self.new_static(decl, owner, Some(&prefix))?;
            scope.define(&decl.name, Named::Static(var))?;
        }

        Ok(())
    }

    fn block(
        &self,
        cx: &mut BodyCx,
        scope: &mut Scope,
        statements: Vec<parse::Statement>,
    ) -> Semantic<Vec<Stmt>> {
        statements
            .into_iter()
            .map(|statement| self.statement(cx, scope, statement))
            .collect()
    }

    fn looping(
        &self,
        cx: &mut BodyCx,
        scope: &mut Scope,
        statements: Vec<parse::Statement>,
    ) -> Semantic<Vec<Stmt>> {
        cx.loops += 1;
        let body = self.block(cx, scope, statements);
        cx.loops -= 1;

        body
    }

    fn statement(
        &self,
        cx: &mut BodyCx,
        scope: &mut Scope,
        statement: parse::Statement,
    ) -> Semantic<Stmt> {
        use parse::Statement as S;

        let statement = match statement {
            S::Let {
                name,
                typ,
                length,
                value,
            } => {
                let length = length.as_ref().map(check_length).transpose()?;
                let value = match value {
                    Some(value) if length.is_some() => {
                        return Err(Located::at(
                            SemanticError::ArrayInitializer,
                            value.location().clone(),
                        ))
                    }

                    Some(value) => Some(self.expr(cx, scope, &value)?),
                    None => None,
                };

                let local = LocalId(cx.locals.len());
                cx.locals.push(Local {
                    name: name.as_ref().clone(),
                    typ: typ.into_inner(),
                    length,
                    hint: None,
                    location: name.location().clone(),
                });

                scope.define(&name, Named::Local(local))?;
                Stmt::Let { local, value }
            }

            S::Yield(location) => {
                suspension(cx, "yield", &location)?;
                Stmt::Yield(location)
            }

            S::WaitUntil { condition, hint } => {
                suspension(cx, "wait_until", condition.location())?;

                Stmt::WaitUntil {
                    location: condition.location().clone(),
                    condition: self.expr(cx, scope, &condition)?,
                    hint,
                }
            }

            S::Call { subroutine, args } => {
                suspension(cx, "call", subroutine.location())?;

                let callee = match scope.lookup(&subroutine)? {
                    Named::Unit(unit) if !self.units[unit.0].is_thread() => unit,
                    _ => {
                        return Err(Located::at(
                            SemanticError::ExpectedSubroutine(subroutine.as_ref().clone()),
                            subroutine.location().clone(),
                        ))
                    }
                };

                let expected = self.units[callee.0].parameters.len();
                arity(&subroutine, expected, args.len())?;

                Stmt::Call {
                    callee,
                    args: self.exprs(cx, scope, &args)?,
                    location: subroutine.location().clone(),
                }
            }

            S::If {
                condition,
                then,
                otherwise,
            } => Stmt::If {
                condition: self.expr(cx, scope, &condition)?,
                then: self.block(cx, scope, then)?,
                otherwise: self.block(cx, scope, otherwise)?,
            },

            S::While { condition, body } => Stmt::While {
                condition: self.expr(cx, scope, &condition)?,
                body: self.looping(cx, scope, body)?,
            },

            S::Loop(body) => Stmt::Loop(self.looping(cx, scope, body)?),

            S::Break(location) => {
                in_loop(cx, "break", location)?;
                Stmt::Break
            }

            S::Continue(location) => {
                in_loop(cx, "continue", location)?;
                Stmt::Continue
            }

            S::Return { value, location } => match (&cx.kind, value) {
                (BodyKind::Function { returns: Some(_), .. }, Some(value)) => {
                    Stmt::Return(Some(self.expr(cx, scope, &value)?))
                }

                (BodyKind::Function { name, returns: Some(_) }, None) => {
                    return Err(Located::at(
                        SemanticError::MissingReturnValue(name.clone()),
                        location,
                    ))
                }

                (_, Some(value)) => {
                    return Err(Located::at(
                        SemanticError::UnexpectedReturnValue,
                        value.location().clone(),
                    ))
                }

                (_, None) => Stmt::Return(None),
            },

            S::Assign { target, op, value } => Stmt::Assign {
                place: self.place(cx, scope, target.as_ref())?,
                op,
                value: self.expr(cx, scope, &value)?,
            },

            S::Eval(expr) => match expr.as_ref() {
                parse::Expr::Call { function, args } => {
                    Stmt::Eval(self.call(cx, scope, function, args, true)?)
                }

                _ => Stmt::Eval(self.expr(cx, scope, &expr)?),
            },
        };

        Ok(statement)
    }

    fn expr(&self, cx: &BodyCx, scope: &Scope, expr: &Located<parse::Expr>) -> Semantic<Expr> {
        use parse::Expr as E;

        let expr = match expr.as_ref() {
            E::Integer(integer) => Expr::Const(*integer),
            E::Char(c) => Expr::Const(*c as i64),
            E::Read(target) => Expr::Read(self.place(cx, scope, target)?),
            E::Call { function, args } => self.call(cx, scope, function, args, false)?,
            E::Unary(op, operand) => Expr::Unary(*op, Box::new(self.expr(cx, scope, operand)?)),
            E::Binary(lhs, op, rhs) => Expr::Binary(
                Box::new(self.expr(cx, scope, lhs)?),
                *op,
                Box::new(self.expr(cx, scope, rhs)?),
            ),
        };

        Ok(expr)
    }

    fn exprs(
        &self,
        cx: &BodyCx,
        scope: &Scope,
        exprs: &[Located<parse::Expr>],
    ) -> Semantic<Vec<Expr>> {
        exprs.iter().map(|expr| self.expr(cx, scope, expr)).collect()
    }

    fn call(
        &self,
        cx: &BodyCx,
        scope: &Scope,
        function: &Located<Identifier>,
        args: &[Located<parse::Expr>],
        statement: bool,
    ) -> Semantic<Expr> {
        let name = function.as_ref();
        let fail = |error| Err(Located::at(error, function.location().clone()));

        let callee = match scope.lookup(function)? {
            Named::Function(id) => {
                let target = &self.functions[id.0];
                arity(function, target.parameters.len(), args.len())?;

                if !statement && target.returns.is_none() {
                    return fail(SemanticError::VoidValue(name.clone()));
                }

                Callee::Function(id)
            }

            Named::Extern(id) if self.externs[id.0].kind == ExternKind::Function => {
                Callee::Extern(id)
            }

            _ => return fail(SemanticError::ExpectedFunction(name.clone())),
        };

        Ok(Expr::Call(callee, self.exprs(cx, scope, args)?))
    }

    fn place(&self, cx: &BodyCx, scope: &Scope, target: &parse::Target) -> Semantic<Place> {
        let variable = &target.variable;
        let fail = |error| Err(Located::at(error, variable.location().clone()));

        let (var, length) = match scope.lookup(variable)? {
            Named::Static(id) => (Var::Static(id), self.statics[id.0].length),
            Named::Local(id) => (Var::Local(id), cx.locals[id.0].length),

            Named::Extern(id) if self.externs[id.0].kind != ExternKind::Function => {
                (Var::Extern(id), None)
            }

            _ => return fail(SemanticError::ExpectedVariable(variable.as_ref().clone())),
        };

        let index = match (length, &target.index) {
            (Some(_), Some(index)) => Some(Box::new(self.expr(cx, scope, index)?)),
            (None, None) => None,
            (Some(_), None) => return fail(SemanticError::ExpectedIndex(variable.as_ref().clone())),
            (None, Some(_)) => return fail(SemanticError::NotAnArray(variable.as_ref().clone())),
        };

        Ok(Place { var, index })
    }

    fn use_reg(&mut self, hint: parse::UseReg, globals: &Scope) -> Semantic<()> {
        let target = self.hint_target(&hint.path, globals)?;

        let class = match &hint.class {
            None => RegisterClass::Any,
            Some(class) => register_class(class)?,
        };

        let register = RegisterHint {
            class,
            location: hint.path.location().clone(),
        };

        match target {
            HintTarget::Static(id) => self.statics[id.0].hint = Some(register),
            HintTarget::Local(Owner::Unit(unit), local) => {
                self.units[unit.0].locals[local.0].hint = Some(register)
            }

            HintTarget::Unit(unit) => self.units[unit.0].state_hint = Some(register),
            _ => return Err(bad_hint_target(&hint.path)),
        }

        trace!(path = %dotted(&hint.path), %class, "register hint attached");
        Ok(())
    }

    fn tune(&mut self, tune: parse::Tune, globals: &Scope) -> Semantic<()> {
        let target = self.hint_target(&tune.path, globals)?;

        let mut requested = Tuning::empty();
        for flag in &tune.flags {
            requested |= if is(flag, "pure") {
                Tuning::PURE
            } else if is(flag, "no_inline") {
                Tuning::NO_INLINE
            } else if is(flag, "always_inline") {
                Tuning::ALWAYS_INLINE
            } else {
                return Err(Located::at(
                    SemanticError::UnknownTuning(flag.as_ref().clone()),
                    flag.location().clone(),
                ));
            };
        }

        let (tuning, pure_allowed) = match target {
            HintTarget::Function(id) => {
                let function = &mut self.functions[id.0];
                (&mut function.tuning, function.returns.is_some())
            }

            HintTarget::Unit(id) => (&mut self.units[id.0].tuning, false),
            HintTarget::Hook(id) => (&mut self.hooks[id.0].tuning, false),
            _ => return Err(bad_hint_target(&tune.path)),
        };

        *tuning |= requested;

        let path = dotted(&tune.path);
        let location = tune.path.location();

        if tuning.contains(Tuning::NO_INLINE | Tuning::ALWAYS_INLINE) {
            tuning.remove(Tuning::ALWAYS_INLINE);
            self.warnings.push(Located::at(
                Warning::ConflictingTuning(path.clone()),
                location.clone(),
            ));
        }

        if !pure_allowed && tuning.contains(Tuning::PURE) {
            tuning.remove(Tuning::PURE);
            self.warnings
                .push(Located::at(Warning::IgnoredTuning(path), location.clone()));
        }

        Ok(())
    }

    /// Resuelve la ruta de una sugerencia, como `writer.send.state`.
    fn hint_target(&self, path: &Located<Vec<Identifier>>, globals: &Scope) -> Semantic<HintTarget> {
        let unknown = || {
            Located::at(
                SemanticError::UnknownReference(dotted(path)),
                path.location().clone(),
            )
        };

        let segments = path.as_ref();
        let mut target = match segments.first().and_then(|first| globals.symbols.get(first)) {
            Some(named) => HintTarget::member(Owner::Global, *named),
            None => return Err(unknown()),
        };

        for (index, segment) in segments.iter().enumerate().skip(1) {
            let owner = match target {
                HintTarget::Unit(unit) => Owner::Unit(unit),
                HintTarget::Function(function) => Owner::Function(function),
                HintTarget::Hook(hook) => Owner::Hook(hook),
                _ => return Err(unknown()),
            };

            target = match self.namespaces.get(&owner).and_then(|names| names.get(segment)) {
                Some(named) => HintTarget::member(owner, *named),

                // `.state` se refiere a la variable de estado de la unidad
                None if segment.as_ref() == "state" && index + 1 == segments.len() => {
                    match owner {
                        Owner::Unit(unit) => HintTarget::Unit(unit),
                        _ => return Err(unknown()),
                    }
                }

                None => return Err(unknown()),
            };
        }

        Ok(target)
    }
}

impl HintTarget {
    fn member(owner: Owner, named: Named) -> Self {
        match named {
            Named::Static(id) => HintTarget::Static(id),
            Named::Local(id) => HintTarget::Local(owner, id),
            Named::Extern(_) => HintTarget::Extern,
            Named::Function(id) => HintTarget::Function(id),
            Named::Unit(id) => HintTarget::Unit(id),
            Named::Hook(id) => HintTarget::Hook(id),
        }
    }
}

fn suspension(cx: &BodyCx, construct: &'static str, location: &Location) -> Semantic<()> {
    match cx.kind {
        BodyKind::Unit => Ok(()),
        _ => Err(Located::at(
            SemanticError::SuspensionOutsideCoroutine(construct),
            location.clone(),
        )),
    }
}

fn in_loop(cx: &BodyCx, construct: &'static str, location: Location) -> Semantic<()> {
    if cx.loops > 0 {
        Ok(())
    } else {
        Err(Located::at(SemanticError::OutsideLoop(construct), location))
    }
}

fn arity(name: &Located<Identifier>, expected: usize, found: usize) -> Semantic<()> {
    if expected == found {
        Ok(())
    } else {
        Err(Located::at(
            SemanticError::ArityMismatch {
                name: name.as_ref().clone(),
                expected,
                found,
            },
            name.location().clone(),
        ))
    }
}

fn check_length(length: &Located<i64>) -> Semantic<u32> {
    match *length.as_ref() {
        length @ 1..=65535 => Ok(length as u32),
        _ => Err(Located::at(
            SemanticError::BadLength,
            length.location().clone(),
        )),
    }
}

/// Evalúa un inicializador en tiempo de compilación.
fn fold(expr: &Located<parse::Expr>) -> Semantic<i64> {
    use parse::Expr as E;

    let not_constant = || Located::at(SemanticError::NotConstant, expr.location().clone());

    match expr.as_ref() {
        E::Integer(integer) => Ok(*integer),
        E::Char(c) => Ok(*c as i64),
        E::Unary(op, operand) => Ok(model::unary(*op, fold(operand)?)),
        E::Binary(lhs, op, rhs) => {
            model::binary(*op, fold(lhs)?, fold(rhs)?).ok_or_else(not_constant)
        }

        E::Read(_) | E::Call { .. } => Err(not_constant()),
    }
}

fn register_class(class: &Located<Identifier>) -> Semantic<RegisterClass> {
    let name = class.as_ref().as_ref();

    let exact = name
        .strip_prefix(|c: char| c == 'r' || c == 'R')
        .filter(|number| !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()))
        .and_then(|number| number.parse::<u8>().ok());

    if let Some(number) = exact {
        Ok(RegisterClass::Exact(number))
    } else if is(class, "low") {
        Ok(RegisterClass::Low)
    } else if is(class, "high") {
        Ok(RegisterClass::High)
    } else if is(class, "any") {
        Ok(RegisterClass::Any)
    } else {
        Err(Located::at(
            SemanticError::UnknownRegisterClass(class.as_ref().clone()),
            class.location().clone(),
        ))
    }
}

fn bad_hint_target(path: &Located<Vec<Identifier>>) -> Located<SemanticError> {
    Located::at(
        SemanticError::BadHintTarget(dotted(path)),
        path.location().clone(),
    )
}

fn dotted(path: &Located<Vec<Identifier>>) -> String {
    path.as_ref()
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<&str>>()
        .join(".")
}

/// Nombres que ya ocupa el código C generado.
const C_RESERVED: &[&str] = &[
    "auto", "break", "case", "char", "const", "continue", "default", "do", "double", "else",
    "enum", "extern", "float", "for", "goto", "if", "inline", "int", "long", "register",
    "restrict", "return", "short", "signed", "sizeof", "static", "struct", "switch", "typedef",
    "union", "unsigned", "void", "volatile", "while", "main", "timebase_ticks", "uint8_t",
    "uint16_t", "uint32_t", "int8_t", "int16_t", "int32_t",
];

/// Los símbolos anidados se unen con `__`. Un segmento sin `__` y sin
/// `_` en sus extremos hace que esa unión sea inyectiva.
fn is_reserved(name: &str) -> bool {
    name.contains("__")
        || name.starts_with('_')
        || name.ends_with('_')
        || name.starts_with("hilos_")
        || C_RESERVED.contains(&name)
}

/// Comparación case-insensitive de palabras contextuales.
fn is(id: &Located<Identifier>, word: &str) -> bool {
    NoCase::new(id.as_ref().as_ref()) == NoCase::new(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lex::Lexer, parse, source};

    fn resolve(text: &str) -> Semantic<Resolved> {
        let (start, stream) = source::consume(text.as_bytes(), "<test>");
        let tokens = Lexer::new(start.clone(), stream).try_exhaustive().unwrap();
        parse::parse(tokens.iter(), start).unwrap().resolve()
    }

    fn error(text: &str) -> SemanticError {
        resolve(text).unwrap_err().into_inner()
    }

    #[test]
    fn units_statics_and_paths() {
        let resolved = resolve(
            "extern volatile u8 UCSR0A;
             static u16 total = 0x10001;
             thread writer {
                 static u8 count;
                 sub send(u8 b) {
                     wait_until UCSR0A & 32;
                 }
                 loop { call send(count); count += 1; yield; }
             }
             main { }",
        )
        .unwrap();

        let model = &resolved.model;
        assert_eq!(model.units.len(), 2);

        let send = model.find_unit("writer.send").unwrap();
        assert_eq!(model.unit(send).symbol, "writer__send");
        assert_eq!(model.unit(send).thread, model.find_unit("writer").unwrap());

        let b = model.find_static("writer.send.b").unwrap();
        assert_eq!(model.static_var(b).symbol, "writer__send__b");
        assert_eq!(model.unit(send).parameters, vec![b]);

        let total = model.find_static("total").unwrap();
        assert_eq!(model.static_var(total).initial, Some(1));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let duplicate = "thread usart_writer { yield; }
                         thread usart_writer { yield; }
                         main { }";

        assert!(matches!(error(duplicate), SemanticError::DuplicateName(name) if name.as_ref() == "usart_writer"));
        assert!(matches!(
            error("thread t { static u8 x; let u8 x; } main { }"),
            SemanticError::DuplicateName(_)
        ));
    }

    #[test]
    fn calls_resolve_outwards_but_not_across_threads() {
        let ok = "thread a {
                      sub outer { yield; }
                      sub inner { call outer; }
                      call inner;
                  }
                  main { }";

        assert!(resolve(ok).is_ok());

        let across = "thread a { sub s { yield; } call s; }
                      thread b { call s; }
                      main { }";

        assert!(matches!(error(across), SemanticError::UnknownReference(name) if name == "s"));
        assert!(matches!(
            error("thread a { call a; } main { }"),
            SemanticError::ExpectedSubroutine(_)
        ));
    }

    #[test]
    fn suspension_is_only_for_coroutines() {
        assert!(matches!(
            error("fn f() { yield; } main { }"),
            SemanticError::SuspensionOutsideCoroutine("yield")
        ));

        assert!(matches!(
            error("every second tick { wait_until 1; } main { }"),
            SemanticError::SuspensionOutsideCoroutine("wait_until")
        ));

        assert!(matches!(
            error("init boot { sub s { } } main { }"),
            SemanticError::SubroutineOutsideThread(_)
        ));
    }

    #[test]
    fn structural_errors() {
        assert!(matches!(error("thread t { }"), SemanticError::MissingEntry));
        assert!(matches!(error("main { break; }"), SemanticError::OutsideLoop("break")));
        assert!(matches!(
            error("thread t { sub s(u8 a) { } call s; } main { }"),
            SemanticError::ArityMismatch {
                expected: 1,
                found: 0,
                ..
            }
        ));

        assert!(matches!(
            error("static u8 buf[4]; main { buf = 1; }"),
            SemanticError::ExpectedIndex(_)
        ));

        assert!(matches!(
            error("static u8 x = y; static u8 y; main { }"),
            SemanticError::NotConstant
        ));

        assert!(matches!(
            error("fn f() { } main { let u8 x = f(); }"),
            SemanticError::VoidValue(_)
        ));

        assert!(matches!(
            error("fn f() -> u8 { return; } main { }"),
            SemanticError::MissingReturnValue(_)
        ));
    }

    #[test]
    fn hints_attach_to_resolved_entities() {
        let resolved = resolve(
            "static u8 hot;
             thread t {
                 sub s { let u8 n; yield; }
                 call s;
             }
             fn half(u8 x) -> u8 { return x / 2; }
             use_reg hot r4;
             use_reg t.s.state high;
             use_reg t.s.n;
             tune half pure, no_inline, always_inline;
             tune t pure;
             main { }",
        )
        .unwrap();

        let model = &resolved.model;
        let hot = model.find_static("hot").unwrap();
        assert_eq!(
            model.static_var(hot).hint.as_ref().map(|hint| hint.class),
            Some(RegisterClass::Exact(4))
        );

        let s = model.unit(model.find_unit("t.s").unwrap());
        assert_eq!(s.state_hint.as_ref().map(|hint| hint.class), Some(RegisterClass::High));
        assert_eq!(s.locals[0].hint.as_ref().map(|hint| hint.class), Some(RegisterClass::Any));

        assert_eq!(model.functions[0].tuning, Tuning::PURE | Tuning::NO_INLINE);
        assert_eq!(model.unit(model.find_unit("t").unwrap()).tuning, Tuning::empty());

        let warnings: Vec<_> = resolved.warnings.iter().map(|w| w.as_ref()).collect();
        assert!(matches!(warnings.as_slice(), [Warning::ConflictingTuning(_), Warning::IgnoredTuning(_)]));
    }

    #[test]
    fn bad_hints() {
        assert!(matches!(
            error("use_reg ghost; main { }"),
            SemanticError::UnknownReference(path) if path == "ghost"
        ));

        assert!(matches!(
            error("static u8 x; use_reg x r4x; main { }"),
            SemanticError::UnknownRegisterClass(_)
        ));

        assert!(matches!(
            error("fn f() { } tune f fast; main { }"),
            SemanticError::UnknownTuning(_)
        ));
    }
}
