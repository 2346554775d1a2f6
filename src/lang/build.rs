//! Terse constructors for building trees in tests.

use super::node::*;
use super::value::Value;

pub fn at(line: u32, mut node: Node) -> Node {
    node.line = line;
    node
}

fn n(kind: NodeKind) -> Node {
    Node::new(1, kind)
}

pub fn nil() -> Node {
    n(NodeKind::Nil)
}

pub fn tru() -> Node {
    n(NodeKind::True)
}

pub fn fals() -> Node {
    n(NodeKind::False)
}

pub fn self_() -> Node {
    n(NodeKind::SelfRef)
}

pub fn int(v: i64) -> Node {
    n(NodeKind::Lit(Value::Integer(v)))
}

pub fn float(v: f64) -> Node {
    n(NodeKind::Lit(Value::Float(v)))
}

pub fn sym(s: &str) -> Node {
    n(NodeKind::Lit(Value::Symbol(s.to_string())))
}

pub fn str_(s: &str) -> Node {
    n(NodeKind::Str(s.to_string()))
}

pub fn array(items: Vec<Node>) -> Node {
    n(NodeKind::Array(items))
}

pub fn splat(node: Node) -> Node {
    n(NodeKind::Splat(Box::new(node)))
}

pub fn lvar(name: &str) -> Node {
    n(NodeKind::LocalVar(name.to_string()))
}

pub fn lasgn(name: &str, value: Node) -> Node {
    n(NodeKind::LocalAsgn {
        name: name.to_string(),
        value: Box::new(value),
    })
}

pub fn ivar(name: &str) -> Node {
    n(NodeKind::IVar(name.to_string()))
}

pub fn konst(name: &str) -> Node {
    n(NodeKind::Const(name.to_string()))
}

pub fn stmts(nodes: Vec<Node>) -> Node {
    n(NodeKind::Block(nodes))
}

pub fn if_(cond: Node, then: Option<Node>, else_: Option<Node>) -> Node {
    n(NodeKind::If {
        cond: Box::new(cond),
        then: then.map(Box::new),
        else_: else_.map(Box::new),
    })
}

pub fn and(l: Node, r: Node) -> Node {
    n(NodeKind::And(Box::new(l), Box::new(r)))
}

pub fn or(l: Node, r: Node) -> Node {
    n(NodeKind::Or(Box::new(l), Box::new(r)))
}

pub fn while_(cond: Node, body: Node) -> Node {
    n(NodeKind::While {
        cond: Box::new(cond),
        body: Some(Box::new(body)),
        do_while: false,
    })
}

pub fn until(cond: Node, body: Node) -> Node {
    n(NodeKind::Until {
        cond: Box::new(cond),
        body: Some(Box::new(body)),
        do_while: false,
    })
}

pub fn case(subject: Option<Node>, whens: Vec<(Vec<Node>, Node)>, else_: Option<Node>) -> Node {
    n(NodeKind::Case {
        subject: subject.map(Box::new),
        whens: whens
            .into_iter()
            .map(|(values, body)| When {
                line: 1,
                values,
                body: Some(body),
            })
            .collect(),
        else_: else_.map(Box::new),
    })
}

pub fn brk(value: Option<Node>) -> Node {
    n(NodeKind::Break(value.map(Box::new)))
}

pub fn next(value: Option<Node>) -> Node {
    n(NodeKind::Next(value.map(Box::new)))
}

pub fn redo() -> Node {
    n(NodeKind::Redo)
}

pub fn retry() -> Node {
    n(NodeKind::Retry)
}

pub fn ret(value: Option<Node>) -> Node {
    n(NodeKind::Return(value.map(Box::new)))
}

pub fn ensure(body: Node, ensure: Node) -> Node {
    n(NodeKind::Ensure {
        body: Some(Box::new(body)),
        ensure: Some(Box::new(ensure)),
    })
}

pub fn rescue(body: Node, clause_body: Node) -> Node {
    n(NodeKind::Rescue {
        body: Some(Box::new(body)),
        clauses: vec![RescueClause {
            line: 1,
            exceptions: vec![],
            var: None,
            body: Some(clause_body),
        }],
        else_: None,
    })
}

pub fn args(args: Vec<Node>) -> CallArgs {
    CallArgs {
        args,
        ..CallArgs::default()
    }
}

pub fn call(recv: Node, name: &str, a: Vec<Node>) -> Node {
    n(NodeKind::Call {
        recv: Some(Box::new(recv)),
        name: name.to_string(),
        args: args(a),
        block: None,
    })
}

pub fn call_args(recv: Option<Node>, name: &str, a: CallArgs) -> Node {
    n(NodeKind::Call {
        recv: recv.map(Box::new),
        name: name.to_string(),
        args: a,
        block: None,
    })
}

pub fn fcall(name: &str, a: Vec<Node>) -> Node {
    n(NodeKind::Call {
        recv: None,
        name: name.to_string(),
        args: args(a),
        block: None,
    })
}

pub fn iter(recv: Node, name: &str, block: Scope) -> Node {
    n(NodeKind::Call {
        recv: Some(Box::new(recv)),
        name: name.to_string(),
        args: CallArgs::default(),
        block: Some(Box::new(block)),
    })
}

pub fn yield_(a: Vec<Node>) -> Node {
    n(NodeKind::Yield(args(a)))
}

pub fn masgn(targets: Vec<&str>, value: Node) -> Node {
    n(NodeKind::MAsgn(MultiAssign {
        targets: targets
            .into_iter()
            .map(|t| AssignTarget::Local(t.to_string()))
            .collect(),
        splat: None,
        post: vec![],
        value: Some(Box::new(value)),
    }))
}

pub fn def(name: &str, scope: Scope) -> Node {
    n(NodeKind::Def {
        name: name.to_string(),
        scope: Box::new(scope),
    })
}

pub fn scope(locals: &[&str], body: Node) -> Scope {
    Scope {
        locals: locals.iter().map(|s| s.to_string()).collect(),
        params: Params::default(),
        body: Some(Box::new(body)),
        line: 1,
        end_line: 1,
    }
}

pub fn scope_with_params(locals: &[&str], params: Params, body: Option<Node>) -> Scope {
    Scope {
        locals: locals.iter().map(|s| s.to_string()).collect(),
        params,
        body: body.map(Box::new),
        line: 1,
        end_line: 1,
    }
}
