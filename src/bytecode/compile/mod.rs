//! Node-to-IR lowering.
//!
//! Every scope (program, method, class body, block, rescue or ensure
//! handler) is compiled by its own [`Builder`] into its own arena. A nested
//! scope is compiled and finalized completely before the instruction that
//! refers to it is emitted in the parent.
//!
//! Each `compile_*` routine appends to a [`Seq`] and obeys one contract:
//! in keep mode (`popped == false`) it leaves exactly one value on the
//! stack, in discard mode it leaves the stack as it found it.

mod assign;
mod call;
pub(crate) mod context;
mod control;
mod define;
mod exit;
mod literal;
mod rescue;

use rustc_hash::FxHashMap;

use crate::bytecode::assemble;
use crate::bytecode::compile_error::{CompileError, Error, InternalError, Result};
use crate::bytecode::ir::{Arena, CatchRegion, LabelId, Operand, Seq};
use crate::bytecode::iseq::{CallSite, CatchKind, InstructionSequence, IseqKind};
use crate::bytecode::op::{Opcode, event};
use crate::bytecode::optimize;
use crate::bytecode::options::CompileOptions;
use crate::bytecode::oracle::RedefinitionOracle;
use crate::bytecode::params::{self, ParamLayout, ParamPlan};
use crate::lang::node::{Node, NodeKind, Params, RescueClause, Scope};
use crate::lang::value::Value;

use assign::{AttrRef, OpUpdate};
use call::CallParts;
use context::{Context, ScopeInfo, SuperParams};
use control::{CaseParts, IfArms, LoopParts};
use define::ClassParts;
use literal::RangeBounds;
use rescue::RescueParts;

/// Local holding the exception inside rescue and ensure handlers.
pub const ERRINFO_LOCAL: &str = "$!";

// =============================================================================
// PUBLIC API
// =============================================================================

/// Compile one scope into a finalized instruction sequence.
///
/// `oracle` decides which operators may be replaced by specialized
/// instructions. Any error aborts the whole compilation; no partial
/// sequence is returned.
pub fn compile(
    scope: &Scope,
    name: &str,
    path: &str,
    kind: IseqKind,
    options: &CompileOptions,
    oracle: &dyn RedefinitionOracle,
) -> Result<InstructionSequence> {
    let _span = tracing::debug_span!("compile", name, path, kind = kind.name()).entered();
    let session = Session {
        options,
        oracle,
        path,
    };
    Builder::new(session, name.to_string(), kind, scope.locals.clone(), scope.line, None)
        .build(ChildBody::Scope(scope))
}

/// Compile a whole program as a top-level scope.
pub fn compile_node_tree(
    scope: &Scope,
    path: &str,
    options: &CompileOptions,
    oracle: &dyn RedefinitionOracle,
) -> Result<InstructionSequence> {
    compile(scope, "<compiled>", path, IseqKind::Top, options, oracle)
}

// =============================================================================
// SCOPE BUILDER
// =============================================================================

/// Inputs shared by every scope of one compilation.
#[derive(Clone, Copy)]
pub(crate) struct Session<'a> {
    pub options: &'a CompileOptions,
    pub oracle: &'a dyn RedefinitionOracle,
    pub path: &'a str,
}

/// What a builder compiles.
pub(crate) enum ChildBody<'n> {
    Scope(&'n Scope),
    Rescue(&'n [RescueClause]),
    Ensure(Option<&'n Node>),
}

pub(crate) struct Builder<'a> {
    arena: Arena,
    session: Session<'a>,
    kind: IseqKind,
    name: String,
    first_line: u32,
    locals: Vec<String>,
    parent: Option<&'a ScopeInfo<'a>>,

    /// Protected ranges of each ensure construct, split as exits inline
    /// the ensure body.
    ensure_ranges: Vec<Vec<(LabelId, LabelId)>>,
    catches: Vec<CatchRegion>,
    children: Vec<InstructionSequence>,

    ivar_caches: FxHashMap<String, u32>,
    inline_cache_size: u32,

    last_line: u32,
    traced_line: Option<u32>,
    opt_labels: Vec<LabelId>,
    /// Method parameters forwarded by a bare `super`, inherited by the
    /// block, rescue and ensure scopes inside the method.
    super_params: Option<SuperParams>,
}

impl<'a> Builder<'a> {
    pub(crate) fn new(
        session: Session<'a>,
        name: String,
        kind: IseqKind,
        locals: Vec<String>,
        first_line: u32,
        parent: Option<&'a ScopeInfo<'a>>,
    ) -> Self {
        Builder {
            arena: Arena::new(),
            session,
            kind,
            name,
            first_line,
            locals,
            parent,
            ensure_ranges: Vec::new(),
            catches: Vec::new(),
            children: Vec::new(),
            ivar_caches: FxHashMap::default(),
            inline_cache_size: 0,
            last_line: first_line,
            traced_line: None,
            opt_labels: Vec::new(),
            super_params: if kind.is_dynamic() {
                parent.and_then(|p| p.super_params).cloned()
            } else {
                None
            },
        }
    }

    fn options(&self) -> &'a CompileOptions {
        self.session.options
    }

    fn path(&self) -> &'a str {
        self.session.path
    }

    pub(crate) fn build(mut self, body: ChildBody<'_>) -> Result<InstructionSequence> {
        let mut ret = Seq::new();
        let ctx = Context::default();

        let layout = match body {
            ChildBody::Scope(scope) => {
                let plan = params::plan(&scope.params, &mut self.locals, self.kind)?;
                if self.kind == IseqKind::Method {
                    self.super_params = Some(self.super_params_of(&scope.params)?);
                }
                self.compile_preamble(&mut ret, &plan)?;
                self.compile_scope_body(&mut ret, scope)?;
                plan.layout
            }
            ChildBody::Rescue(clauses) => {
                self.compile_rescue_clauses(&mut ret, clauses, ctx)?;
                ParamLayout::default()
            }
            ChildBody::Ensure(node) => {
                if let Some(node) = node {
                    self.compile_stmt(&mut ret, node, true, ctx)?;
                }
                ParamLayout::default()
            }
        };

        let line = self.last_line;
        match self.kind {
            IseqKind::Rescue | IseqKind::Ensure => {
                self.get_local(&mut ret, line, ERRINFO_LOCAL)?;
                self.emit(&mut ret, line, Opcode::Throw, vec![Operand::Num(0)]);
            }
            _ => {
                self.emit(&mut ret, line, Opcode::Leave, vec![]);
            }
        }

        self.finish(ret, layout)
    }

    /// Default-value initializers for optional and keyword parameters.
    fn compile_preamble(&mut self, ret: &mut Seq, plan: &ParamPlan<'_>) -> Result<()> {
        let ctx = Context::default();

        if !plan.opt_defaults.is_empty() {
            let first = self.new_opt_label();
            self.bind(ret, first);
            for default in &plan.opt_defaults {
                let line = default.value.line;
                self.compile_node(ret, default.value, false, ctx)?;
                self.set_local_slot(ret, line, default.slot, 0);
                let next = self.new_opt_label();
                self.bind(ret, next);
            }
        }

        if let Some(kw) = &plan.layout.keyword {
            for default in &plan.kw_defaults {
                let line = default.value.line;
                let skip = self.arena.new_label();
                self.emit(
                    ret,
                    line,
                    Opcode::CheckKeyword,
                    vec![
                        Operand::Num(i64::from(kw.bits_start)),
                        Operand::Num(default.index as i64),
                    ],
                );
                self.branch(ret, line, Opcode::BranchIf, skip);
                self.compile_node(ret, default.value, false, ctx)?;
                self.set_local_slot(ret, line, default.slot, 0);
                self.bind(ret, skip);
            }
        }
        Ok(())
    }

    fn super_params_of(&self, params: &Params) -> Result<SuperParams> {
        let slot = |name: &String| -> Result<usize> {
            self.locals
                .iter()
                .position(|l| l == name)
                .ok_or_else(|| InternalError::UnknownLocal(name.clone()).into())
        };
        Ok(SuperParams {
            lead: params
                .lead
                .iter()
                .chain(params.opt.iter().map(|(name, _)| name))
                .map(slot)
                .collect::<Result<_>>()?,
            rest: params.rest.as_ref().map(slot).transpose()?,
            post: params.post.iter().map(slot).collect::<Result<_>>()?,
            keywords: params
                .keywords
                .iter()
                .map(|kw| -> Result<(String, usize)> { Ok((kw.name.clone(), slot(&kw.name)?)) })
                .collect::<Result<_>>()?,
            kwrest: params.kwrest.as_ref().map(slot).transpose()?,
            block: params.block.as_ref().map(slot).transpose()?,
        })
    }

    fn new_opt_label(&mut self) -> LabelId {
        let label = self.arena.new_label();
        self.arena.add_label_ref(label);
        self.opt_labels.push(label);
        label
    }

    /// Body of a method, class, block or program, with its trace events.
    fn compile_scope_body(&mut self, ret: &mut Seq, scope: &Scope) -> Result<()> {
        let ctx = Context::default();
        let body = scope.body.as_deref();

        match self.kind {
            IseqKind::Method => {
                self.trace(ret, scope.line, event::CALL);
                self.compile_body(ret, body, ctx)?;
                let end = self.end_line(scope);
                self.trace(ret, end, event::RETURN);
            }
            IseqKind::Class => {
                self.trace(ret, scope.line, event::CLASS);
                self.compile_body(ret, body, ctx)?;
                let end = self.end_line(scope);
                self.trace(ret, end, event::END);
            }
            IseqKind::Block => {
                let start = self.arena.new_label();
                let end = self.arena.new_label();
                self.arena.label_mut(start).rescued = crate::bytecode::ir::RescueMark::Begin;
                self.arena.label_mut(end).rescued = crate::bytecode::ir::RescueMark::End;

                self.trace(ret, scope.line, event::B_CALL);
                self.bind(ret, start);
                let labels = context::LoopLabels {
                    start,
                    end,
                    redo: None,
                };
                self.compile_body(ret, body, ctx.with_loop(labels))?;
                self.bind(ret, end);
                let end_line = self.end_line(scope);
                self.trace(ret, end_line, event::B_RETURN);

                self.add_catch(CatchKind::Redo, start, end, start, None);
                self.add_catch(CatchKind::Next, start, end, end, None);
            }
            _ => self.compile_body(ret, body, ctx)?,
        }
        Ok(())
    }

    fn compile_body<'f>(
        &mut self,
        ret: &mut Seq,
        body: Option<&'f Node>,
        ctx: Context<'f>,
    ) -> Result<()> {
        match body {
            Some(node) => self.compile_stmt(ret, node, false, ctx),
            None => {
                let line = self.last_line;
                self.emit(ret, line, Opcode::PutNil, vec![]);
                Ok(())
            }
        }
    }

    fn end_line(&self, scope: &Scope) -> u32 {
        if scope.end_line > 0 {
            scope.end_line
        } else {
            self.last_line
        }
    }

    fn finish(mut self, mut ret: Seq, mut layout: ParamLayout) -> Result<InstructionSequence> {
        let options = self.session.options;
        tracing::trace!(scope = %self.name, "lowered:\n{}", self.arena.dump(&ret));

        optimize::run(&mut self.arena, &mut ret, self.kind, options, self.session.oracle)?;
        if options.instructions_unification {
            optimize::unify::run(&mut self.arena, &mut ret);
        }
        let cache = if options.stack_caching {
            optimize::stack_cache::run(&mut self.arena, &mut ret)?
        } else {
            Vec::new()
        };

        let out = assemble::assemble(
            &mut self.arena,
            &ret,
            &assemble::Tables {
                catches: &self.catches,
                opt_labels: &self.opt_labels,
                inline_cache_size: self.inline_cache_size,
                stack_cache: &cache,
            },
        )?;

        layout.opt_table = out.opt_table;
        let mut iseq = InstructionSequence::empty(
            self.name,
            self.kind,
            self.session.path.to_string(),
            self.first_line,
        );
        iseq.local_table = self.locals;
        iseq.params = layout;
        iseq.code = out.code;
        iseq.literals = out.literals;
        iseq.identifiers = out.identifiers;
        iseq.globals = out.globals;
        iseq.call_infos = out.call_infos;
        iseq.dispatch_maps = out.dispatch_maps;
        iseq.inline_cache_size = self.inline_cache_size;
        iseq.line_table = out.line_table;
        iseq.catch_table = out.catch_table;
        iseq.stack_max = out.stack_max;
        iseq.stack_cache = out.stack_cache;
        iseq.children = self.children;
        iseq.freeze_code();

        tracing::debug!(
            name = %iseq.name,
            kind = iseq.kind.name(),
            words = iseq.code().len(),
            stack_max = iseq.stack_max,
            "finalized scope"
        );
        Ok(iseq)
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    fn compile_stmt<'f>(
        &mut self,
        ret: &mut Seq,
        node: &'f Node,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        if self.options().trace_instruction
            && self.traced_line != Some(node.line)
            && !matches!(node.kind, NodeKind::Block(_))
        {
            self.traced_line = Some(node.line);
            self.emit(ret, node.line, Opcode::Trace, vec![Operand::Num(event::LINE)]);
        }
        self.compile_node(ret, node, popped, ctx)
    }

    fn compile_node<'f>(
        &mut self,
        ret: &mut Seq,
        node: &'f Node,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        let line = node.line;
        self.last_line = line;

        match &node.kind {
            NodeKind::Nil => self.nil_unless(ret, line, popped),
            NodeKind::True => self.put_value(ret, line, Value::True, popped),
            NodeKind::False => self.put_value(ret, line, Value::False, popped),
            NodeKind::SelfRef => {
                if !popped {
                    self.emit(ret, line, Opcode::PutSelf, vec![]);
                }
            }
            NodeKind::Lit(v) => self.put_value(ret, line, v.clone(), popped),
            NodeKind::Str(s) => self.compile_str(ret, line, s, popped),
            NodeKind::DStr(parts) => self.compile_dstr(ret, line, parts, popped, ctx)?,
            NodeKind::Array(items) => self.compile_array(ret, line, items, popped, ctx)?,
            NodeKind::Hash(pairs) => self.compile_hash(ret, line, pairs, popped, ctx)?,
            NodeKind::Range {
                low,
                high,
                exclusive,
            } => {
                let bounds = RangeBounds {
                    low,
                    high,
                    exclusive: *exclusive,
                };
                self.compile_range(ret, line, bounds, popped, ctx)?
            }
            NodeKind::Splat(inner) => {
                self.compile_node(ret, inner, false, ctx)?;
                self.emit(ret, line, Opcode::SplatArray, vec![Operand::Value(Value::True)]);
                self.pop_if(ret, line, popped);
            }

            NodeKind::LocalVar(name) => {
                if !popped {
                    self.get_local(ret, line, name)?;
                }
            }
            NodeKind::LocalAsgn { name, value } => {
                self.compile_node(ret, value, false, ctx)?;
                self.dup_unless(ret, line, popped);
                self.set_local(ret, line, name)?;
            }
            NodeKind::IVar(name) => {
                if !popped {
                    self.get_ivar(ret, line, name);
                }
            }
            NodeKind::IAsgn { name, value } => {
                self.compile_node(ret, value, false, ctx)?;
                self.dup_unless(ret, line, popped);
                self.set_ivar(ret, line, name);
            }
            NodeKind::GVar(name) => {
                self.emit(ret, line, Opcode::GetGlobal, vec![Operand::Global(name.clone())]);
                self.pop_if(ret, line, popped);
            }
            NodeKind::GAsgn { name, value } => {
                self.compile_node(ret, value, false, ctx)?;
                self.dup_unless(ret, line, popped);
                self.emit(ret, line, Opcode::SetGlobal, vec![Operand::Global(name.clone())]);
            }
            NodeKind::CVar(name) => {
                self.emit(ret, line, Opcode::GetClassVariable, vec![Operand::Id(name.clone())]);
                self.pop_if(ret, line, popped);
            }
            NodeKind::CVAsgn { name, value } => {
                self.compile_node(ret, value, false, ctx)?;
                self.dup_unless(ret, line, popped);
                self.emit(ret, line, Opcode::SetClassVariable, vec![Operand::Id(name.clone())]);
            }
            NodeKind::Const(name) => self.compile_const(ret, line, name, popped),
            NodeKind::ScopedConst { scope, name } => {
                self.compile_node(ret, scope, false, ctx)?;
                self.emit(ret, line, Opcode::GetConstant, vec![Operand::Id(name.clone())]);
                self.pop_if(ret, line, popped);
            }
            NodeKind::TopConst(name) => self.compile_top_const(ret, line, name, popped),
            NodeKind::ConstDecl { name, value } => {
                self.compile_node(ret, value, false, ctx)?;
                self.dup_unless(ret, line, popped);
                self.store_const(ret, line, name);
            }

            NodeKind::MAsgn(masgn) => self.compile_masgn(ret, line, masgn, popped, ctx)?,
            NodeKind::OpAsgn { target, op, value } => {
                self.compile_op_asgn(ret, line, target, OpUpdate { op, value }, popped, ctx)?
            }
            NodeKind::AttrAsgn { recv, name, args } => {
                self.compile_attr_asgn(ret, line, AttrRef { recv, name, args }, popped, ctx)?
            }

            NodeKind::Block(stmts) => {
                if stmts.is_empty() {
                    self.nil_unless(ret, line, popped);
                }
                for (i, stmt) in stmts.iter().enumerate() {
                    let last = i + 1 == stmts.len();
                    self.compile_stmt(ret, stmt, popped || !last, ctx)?;
                }
            }
            NodeKind::If { cond, then, else_ } => {
                let arms = IfArms {
                    then: then.as_deref(),
                    else_: else_.as_deref(),
                };
                self.compile_if(ret, line, cond, arms, popped, ctx)?
            }
            NodeKind::And(l, r) => {
                self.compile_logical(ret, line, (&**l, &**r), Opcode::BranchUnless, popped, ctx)?
            }
            NodeKind::Or(l, r) => {
                self.compile_logical(ret, line, (&**l, &**r), Opcode::BranchIf, popped, ctx)?
            }
            NodeKind::Not(inner) => {
                self.compile_node(ret, inner, false, ctx)?;
                self.send(ret, line, CallSite::new("!", 0, crate::bytecode::iseq::call_flag::ARGS_SIMPLE));
                self.pop_if(ret, line, popped);
            }
            NodeKind::Case {
                subject,
                whens,
                else_,
            } => {
                let case = CaseParts {
                    subject: subject.as_deref(),
                    whens,
                    else_: else_.as_deref(),
                };
                self.compile_case(ret, line, case, popped, ctx)?
            }
            NodeKind::While {
                cond,
                body,
                do_while,
            }
            | NodeKind::Until {
                cond,
                body,
                do_while,
            } => {
                let parts = LoopParts {
                    is_while: matches!(node.kind, NodeKind::While { .. }),
                    cond,
                    body: body.as_deref(),
                    do_while: *do_while,
                };
                self.compile_loop(ret, line, parts, popped, ctx)?
            }

            NodeKind::Break(value) => self.compile_break(ret, line, value.as_deref(), popped, ctx)?,
            NodeKind::Next(value) => self.compile_next(ret, line, value.as_deref(), popped, ctx)?,
            NodeKind::Redo => self.compile_redo(ret, line, popped, ctx)?,
            NodeKind::Retry => self.compile_retry(ret, line, popped)?,
            NodeKind::Return(value) => self.compile_return(ret, line, value.as_deref(), popped, ctx)?,

            NodeKind::Begin(body) => self.compile_opt(ret, line, body.as_deref(), popped, ctx)?,
            NodeKind::Rescue {
                body,
                clauses,
                else_,
            } => {
                let parts = RescueParts {
                    body: body.as_deref(),
                    clauses,
                    else_: else_.as_deref(),
                };
                self.compile_rescue(ret, line, parts, popped, ctx)?
            }
            NodeKind::Ensure { body, ensure } => {
                self.compile_ensure(ret, line, body.as_deref(), ensure.as_deref(), popped, ctx)?
            }

            NodeKind::Call {
                recv,
                name,
                args,
                block,
            } => {
                let call = CallParts {
                    recv: recv.as_deref(),
                    name,
                    args,
                    block: block.as_deref(),
                };
                self.compile_call(ret, line, call, popped, ctx)?
            }
            NodeKind::Yield(args) => self.compile_yield(ret, line, args, popped, ctx)?,
            NodeKind::Super(args) => self.compile_super(ret, line, args.as_ref(), popped, ctx)?,

            NodeKind::Def { name, scope } => self.compile_def(ret, line, name, scope, popped, ctx)?,
            NodeKind::Class {
                name,
                superclass,
                scope,
            } => {
                let class = ClassParts {
                    name,
                    superclass: superclass.as_deref(),
                    scope,
                };
                self.compile_class(ret, line, class, popped, ctx)?
            }
            NodeKind::Module { name, scope } => self.compile_module(ret, line, name, scope, popped, ctx)?,
        }
        Ok(())
    }

    /// Compile `node`, or push nil in its place.
    fn compile_opt<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        node: Option<&'f Node>,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        match node {
            Some(node) => self.compile_node(ret, node, popped, ctx),
            None => {
                self.nil_unless(ret, line, popped);
                Ok(())
            }
        }
    }

    // =========================================================================
    // EMISSION HELPERS
    // =========================================================================

    fn emit(&mut self, ret: &mut Seq, line: u32, opcode: Opcode, operands: Vec<Operand>) {
        self.arena.emit(ret, line, opcode, operands);
    }

    fn bind(&mut self, ret: &mut Seq, label: LabelId) {
        self.arena.bind(ret, label);
    }

    fn branch(&mut self, ret: &mut Seq, line: u32, opcode: Opcode, target: LabelId) {
        self.emit(ret, line, opcode, vec![Operand::Label(target)]);
    }

    fn send(&mut self, ret: &mut Seq, line: u32, ci: CallSite) {
        self.emit(ret, line, Opcode::Send, vec![Operand::CallInfo(ci)]);
    }

    fn put_value(&mut self, ret: &mut Seq, line: u32, value: Value, popped: bool) {
        if !popped {
            self.emit(ret, line, Opcode::PutObject, vec![Operand::Value(value)]);
        }
    }

    fn nil_unless(&mut self, ret: &mut Seq, line: u32, popped: bool) {
        if !popped {
            self.emit(ret, line, Opcode::PutNil, vec![]);
        }
    }

    fn pop_if(&mut self, ret: &mut Seq, line: u32, popped: bool) {
        if popped {
            self.emit(ret, line, Opcode::Pop, vec![]);
        }
    }

    fn dup_unless(&mut self, ret: &mut Seq, line: u32, popped: bool) {
        if !popped {
            self.emit(ret, line, Opcode::Dup, vec![]);
        }
    }

    fn trace(&mut self, ret: &mut Seq, line: u32, ev: i64) {
        if self.options().trace_instruction {
            self.emit(ret, line, Opcode::Trace, vec![Operand::Num(ev)]);
        }
    }

    fn add_catch(
        &mut self,
        kind: CatchKind,
        start: LabelId,
        end: LabelId,
        cont: LabelId,
        child: Option<u32>,
    ) {
        for label in [start, end, cont] {
            self.arena.add_label_ref(label);
        }
        self.catches.push(CatchRegion {
            kind,
            start,
            end,
            cont,
            child,
        });
    }

    fn new_inline_cache(&mut self) -> u32 {
        let idx = self.inline_cache_size;
        self.inline_cache_size += 1;
        idx
    }

    // -------------------------------------------------------------------------
    // Variables
    // -------------------------------------------------------------------------

    fn lookup_local(&self, name: &str) -> Result<(usize, usize)> {
        context::resolve_local(self.kind, &self.locals, self.parent, name)
            .ok_or_else(|| InternalError::UnknownLocal(name.to_string()).into())
    }

    fn get_local(&mut self, ret: &mut Seq, line: u32, name: &str) -> Result<()> {
        let (idx, level) = self.lookup_local(name)?;
        self.emit(
            ret,
            line,
            Opcode::GetLocal,
            vec![Operand::Num(idx as i64), Operand::Num(level as i64)],
        );
        Ok(())
    }

    fn set_local(&mut self, ret: &mut Seq, line: u32, name: &str) -> Result<()> {
        let (idx, level) = self.lookup_local(name)?;
        self.set_local_slot(ret, line, idx, level);
        Ok(())
    }

    fn set_local_slot(&mut self, ret: &mut Seq, line: u32, idx: usize, level: usize) {
        self.emit(
            ret,
            line,
            Opcode::SetLocal,
            vec![Operand::Num(idx as i64), Operand::Num(level as i64)],
        );
    }

    /// One inline cache per instance-variable name.
    fn ivar_cache(&mut self, name: &str) -> u32 {
        if let Some(ic) = self.ivar_caches.get(name) {
            return *ic;
        }
        let ic = self.new_inline_cache();
        self.ivar_caches.insert(name.to_string(), ic);
        ic
    }

    fn get_ivar(&mut self, ret: &mut Seq, line: u32, name: &str) {
        let ic = self.ivar_cache(name);
        self.emit(
            ret,
            line,
            Opcode::GetInstanceVariable,
            vec![Operand::Id(name.to_string()), Operand::InlineCache(ic)],
        );
    }

    fn set_ivar(&mut self, ret: &mut Seq, line: u32, name: &str) {
        let ic = self.ivar_cache(name);
        self.emit(
            ret,
            line,
            Opcode::SetInstanceVariable,
            vec![Operand::Id(name.to_string()), Operand::InlineCache(ic)],
        );
    }

    // -------------------------------------------------------------------------
    // Child scopes
    // -------------------------------------------------------------------------

    /// Compile a nested scope and register it as a child.
    fn new_child(
        &mut self,
        name: String,
        kind: IseqKind,
        locals: Vec<String>,
        line: u32,
        body: ChildBody<'_>,
        ctx: Context<'_>,
    ) -> Result<u32> {
        let info = ScopeInfo {
            kind: self.kind,
            locals: &self.locals,
            in_while: ctx.in_while(),
            super_params: self.super_params.as_ref(),
            parent: self.parent,
        };
        let session = self.session;
        let child = Builder::new(session, name, kind, locals, line, Some(&info)).build(body)?;

        let idx = self.children.len() as u32;
        self.children.push(child);
        Ok(idx)
    }

    fn compile_error(&self, make: fn(&str, u32) -> CompileError, line: u32) -> Error {
        make(self.path(), line).into()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bytecode::iseq::{CatchKind, Word};
    use crate::bytecode::oracle::StaticOracle;
    use crate::lang::build::*;

    pub(crate) fn quiet() -> CompileOptions {
        CompileOptions {
            trace_instruction: false,
            ..CompileOptions::default()
        }
    }

    pub(crate) fn compile_with(
        locals: &[&str],
        body: Node,
        kind: IseqKind,
        options: CompileOptions,
    ) -> Result<InstructionSequence> {
        let oracle = StaticOracle::pristine();
        compile(&scope(locals, body), "test", "test.rb", kind, &options, &oracle)
    }

    pub(crate) fn compile_method(locals: &[&str], body: Node) -> InstructionSequence {
        compile_with(locals, body, IseqKind::Method, quiet()).unwrap()
    }

    /// Target position of every jump-like operand.
    fn jump_targets(iseq: &InstructionSequence) -> Vec<i64> {
        let mut out = Vec::new();
        for start in iseq.instruction_boundaries() {
            let Word::Op(op) = iseq.code[start] else { continue };
            let end = start + op.len();
            for word in &iseq.code[start + 1..end] {
                if let Word::Offset(off) = word {
                    out.push(end as i64 + i64::from(*off));
                }
            }
        }
        out
    }

    #[test]
    fn test_assignment_of_sum_in_method() {
        let iseq = compile_method(&["a"], lasgn("a", call(int(1), "+", vec![int(2)])));
        assert_eq!(
            iseq.opcodes(),
            vec![
                Opcode::PutObject,
                Opcode::PutObject,
                Opcode::OptPlus,
                Opcode::Dup,
                Opcode::SetLocal,
                Opcode::Leave
            ]
        );
        assert_eq!(iseq.literals, vec![Value::Integer(1), Value::Integer(2)]);
    }

    #[test]
    fn test_assignment_without_specialization_uses_send() {
        let options = CompileOptions {
            specialized_instruction: false,
            ..quiet()
        };
        let body = stmts(vec![lasgn("a", call(int(1), "+", vec![int(2)])), lvar("a")]);
        let iseq = compile_with(&["a"], body, IseqKind::Method, options).unwrap();
        assert_eq!(
            iseq.opcodes(),
            vec![
                Opcode::PutObject,
                Opcode::PutObject,
                Opcode::Send,
                Opcode::SetLocal,
                Opcode::GetLocal,
                Opcode::Leave
            ]
        );
        assert_eq!(iseq.call_infos[0].mid, "+");
        assert_eq!(iseq.call_infos[0].argc, 1);
    }

    #[test]
    fn test_redefined_operator_is_not_specialized() {
        let oracle = StaticOracle::with_redefined(["+"]);
        let body = call(int(1), "+", vec![int(2)]);
        let iseq = compile(&scope(&[], body), "m", "t.rb", IseqKind::Method, &quiet(), &oracle).unwrap();
        assert!(iseq.opcodes().contains(&Opcode::OptSendWithoutBlock));
        assert!(!iseq.opcodes().contains(&Opcode::OptPlus));
    }

    #[test]
    fn test_method_traces_call_and_return() {
        let iseq = compile_with(&[], int(1), IseqKind::Method, CompileOptions::default()).unwrap();
        let ops = iseq.opcodes();
        assert_eq!(ops.first(), Some(&Opcode::Trace));
        assert_eq!(ops.last(), Some(&Opcode::Leave));
        assert!(iseq.code.contains(&Word::Num(event::CALL)));
        assert!(iseq.code.contains(&Word::Num(event::RETURN)));
        assert!(iseq.code.contains(&Word::Num(event::LINE)));
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let body = stmts(vec![
            lasgn("a", int(1)),
            while_(lvar("a"), lasgn("a", call(lvar("a"), "-", vec![int(1)]))),
            case(
                Some(lvar("a")),
                vec![(vec![int(1)], str_("one")), (vec![sym("x")], str_("x"))],
                None,
            ),
        ]);
        let first = compile_with(&["a"], body.clone(), IseqKind::Method, CompileOptions::all()).unwrap();
        let second = compile_with(&["a"], body, IseqKind::Method, CompileOptions::all()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_bytes().unwrap(), second.to_bytes().unwrap());
    }

    #[test]
    fn test_jump_targets_land_on_boundaries() {
        let body = stmts(vec![
            lasgn("i", int(0)),
            while_(
                call(lvar("i"), "<", vec![int(10)]),
                stmts(vec![
                    if_(call(lvar("i"), "==", vec![int(5)]), Some(brk(None)), None),
                    lasgn("i", call(lvar("i"), "+", vec![int(1)])),
                ]),
            ),
            or(lvar("i"), int(3)),
        ]);
        for options in [CompileOptions::none(), CompileOptions::default(), CompileOptions::all()] {
            let iseq = compile_with(&["i"], body.clone(), IseqKind::Method, options).unwrap();
            let bounds = iseq.instruction_boundaries();
            for target in jump_targets(&iseq) {
                assert!(bounds.contains(&(target as usize)), "target {} off boundary", target);
            }
        }
    }

    #[test]
    fn test_line_table_is_monotonic() {
        let body = stmts(vec![
            at(1, lasgn("a", int(1))),
            at(2, lasgn("b", int(2))),
            at(3, call(lvar("a"), "+", vec![lvar("b")])),
        ]);
        let iseq = compile_with(&["a", "b"], body, IseqKind::Method, CompileOptions::default()).unwrap();
        let bounds = iseq.instruction_boundaries();

        assert!(iseq.line_table.len() >= 3);
        for pair in iseq.line_table.windows(2) {
            assert!(pair[0].position < pair[1].position);
        }
        for entry in &iseq.line_table {
            assert!(bounds.contains(&(entry.position as usize)));
        }
    }

    #[test]
    fn test_discard_mode_is_stack_neutral() {
        // every statement but the last is compiled popped
        let body = stmts(vec![
            int(1),
            str_("s"),
            array(vec![int(1), lvar("a")]),
            call(lvar("a"), "foo", vec![]),
            and(lvar("a"), int(2)),
            nil(),
        ]);
        let iseq = compile_with(&["a"], body, IseqKind::Method, CompileOptions::none()).unwrap();
        assert_eq!(iseq.stack_max, 1);
        crate::bytecode::stack_check::check(&iseq).unwrap();
    }

    #[test]
    fn test_unknown_local_is_internal() {
        let err = compile_with(&[], lvar("ghost"), IseqKind::Method, quiet()).unwrap_err();
        assert!(err.is_internal());
        assert!(matches!(err, Error::Internal(InternalError::UnknownLocal(_))));
    }

    #[test]
    fn test_block_scope_catch_entries() {
        let block = scope(&["x"], lvar("x"));
        let iseq = compile_method(&[], iter(self_(), "each", block));
        let child = &iseq.children[0];

        assert_eq!(child.kind, IseqKind::Block);
        assert_eq!(child.name, "block in test");
        let kinds: Vec<_> = child.catch_table.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![CatchKind::Redo, CatchKind::Next]);
        assert_eq!(iseq.catch_table[0].kind, CatchKind::Break);
        assert_eq!(iseq.catch_table[0].child, Some(0));
    }

    #[test]
    fn test_block_reads_outer_local_with_level() {
        let block = scope(&[], lvar("a"));
        let body = stmts(vec![lasgn("a", int(1)), iter(self_(), "each", block)]);
        let iseq = compile_with(&["a"], body, IseqKind::Method, CompileOptions::none()).unwrap();
        let child = &iseq.children[0];
        let ops = child.opcodes();
        assert_eq!(ops[0], Opcode::GetLocal);
        assert_eq!(child.code[1..3], [Word::Num(0), Word::Num(1)]);
    }
}
