//! Tree analyses the compiler runs before emission: free variables (for
//! closure capture) and maximum live let-depth (for frame sizing).

use std::collections::{BTreeSet, HashSet};

use crate::ast::Expr;

/// Identifiers referenced by `expr` but not bound within it, in lexicographic
/// order.
///
/// The ordering is load-bearing: the site that allocates a closure and the
/// prologue that restores its captures both walk this list, and they agree
/// on layout only because the order is deterministic.
pub fn free_vars(expr: &Expr) -> Vec<String> {
    let mut free = BTreeSet::new();
    collect_free_vars(expr, &HashSet::new(), &mut free);
    free.into_iter().collect()
}

fn collect_free_vars(expr: &Expr, bound: &HashSet<String>, free: &mut BTreeSet<String>) {
    match expr {
        Expr::Number { .. } | Expr::Bool { .. } => {}
        Expr::Id { name, .. } => {
            if !bound.contains(name) {
                free.insert(name.clone());
            }
        }
        Expr::Let { name, value, body, .. } => {
            collect_free_vars(value, bound, free);
            let mut inner = bound.clone();
            inner.insert(name.clone());
            collect_free_vars(body, &inner, free);
        }
        Expr::If { cond, then_branch, else_branch, .. } => {
            collect_free_vars(cond, bound, free);
            collect_free_vars(then_branch, bound, free);
            collect_free_vars(else_branch, bound, free);
        }
        Expr::Prim1 { arg, .. } => collect_free_vars(arg, bound, free),
        Expr::Prim2 { lhs, rhs, .. } => {
            collect_free_vars(lhs, bound, free);
            collect_free_vars(rhs, bound, free);
        }
        Expr::Tuple { elems, .. } => {
            for e in elems {
                collect_free_vars(e, bound, free);
            }
        }
        Expr::GetItem { tuple, index, .. } => {
            collect_free_vars(tuple, bound, free);
            collect_free_vars(index, bound, free);
        }
        Expr::Lam { params, body, .. } => {
            let mut inner = bound.clone();
            for p in params {
                inner.insert(p.clone());
            }
            collect_free_vars(body, &inner, free);
        }
        Expr::Fun { name, params, body, .. } => {
            let mut inner = bound.clone();
            inner.insert(name.clone());
            for p in params {
                inner.insert(p.clone());
            }
            collect_free_vars(body, &inner, free);
        }
        Expr::App { func, args, .. } => {
            collect_free_vars(func, bound, free);
            for a in args {
                collect_free_vars(a, bound, free);
            }
        }
    }
}

/// Maximum number of let bindings live at once.
///
/// Operand positions are immediate in ANF, so only `Let` consumes a slot and
/// only `Let`/`If` recurse into positions that can. Function bodies get their
/// own frame and contribute nothing to the enclosing count.
pub fn count_vars(expr: &Expr) -> usize {
    match expr {
        Expr::Let { value, body, .. } => count_vars(value).max(1 + count_vars(body)),
        Expr::If { then_branch, else_branch, .. } => {
            count_vars(then_branch).max(count_vars(else_branch))
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Prim2, Span, Tag};

    fn t(id: u32) -> Tag {
        Tag::new(Span::new(0, 0), id)
    }

    fn id(name: &str, n: u32) -> Expr {
        Expr::Id { name: name.into(), tag: t(n) }
    }

    #[test]
    fn test_free_vars_sorted() {
        let e = Expr::Prim2 {
            op: Prim2::Plus,
            lhs: Box::new(id("zeta", 0)),
            rhs: Box::new(id("alpha", 1)),
            tag: t(2),
        };
        assert_eq!(free_vars(&e), vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn test_let_binds_body_only() {
        // let x = x in x : the rhs occurrence is free, the body one is not
        let e = Expr::Let {
            name: "x".into(),
            value: Box::new(id("x", 0)),
            body: Box::new(id("x", 1)),
            tag: t(2),
        };
        assert_eq!(free_vars(&e), vec!["x".to_string()]);
    }

    #[test]
    fn test_lam_params_bound() {
        let e = Expr::Lam {
            params: vec!["x".into()],
            body: Box::new(Expr::Prim2 {
                op: Prim2::Plus,
                lhs: Box::new(id("x", 0)),
                rhs: Box::new(id("y", 1)),
                tag: t(2),
            }),
            tag: t(3),
        };
        assert_eq!(free_vars(&e), vec!["y".to_string()]);
    }

    #[test]
    fn test_fun_name_bound_in_body() {
        let e = Expr::Fun {
            name: "loop".into(),
            params: vec!["n".into()],
            body: Box::new(Expr::App {
                func: Box::new(id("loop", 0)),
                args: vec![id("n", 1), id("acc", 2)],
                tag: t(3),
            }),
            tag: t(4),
        };
        assert_eq!(free_vars(&e), vec!["acc".to_string()]);
    }

    #[test]
    fn test_count_vars_nesting() {
        let num = |v: i32, n: u32| Expr::Number { value: v, tag: t(n) };
        // let a = 1 in let b = 2 in b  -> two concurrent slots
        let e = Expr::Let {
            name: "a".into(),
            value: Box::new(num(1, 0)),
            body: Box::new(Expr::Let {
                name: "b".into(),
                value: Box::new(num(2, 1)),
                body: Box::new(id("b", 2)),
                tag: t(3),
            }),
            tag: t(4),
        };
        assert_eq!(count_vars(&e), 2);

        // bindings inside a rhs die before the outer binding exists
        let rhs_heavy = Expr::Let {
            name: "a".into(),
            value: Box::new(Expr::Let {
                name: "tmp".into(),
                value: Box::new(num(1, 0)),
                body: Box::new(id("tmp", 1)),
                tag: t(2),
            }),
            body: Box::new(id("a", 3)),
            tag: t(4),
        };
        assert_eq!(count_vars(&rhs_heavy), 1);
    }

    #[test]
    fn test_count_vars_if_branches_share_slots() {
        let num = |v: i32, n: u32| Expr::Number { value: v, tag: t(n) };
        let branch = |base: u32| Expr::Let {
            name: "x".into(),
            value: Box::new(num(1, base)),
            body: Box::new(id("x", base + 1)),
            tag: t(base + 2),
        };
        let e = Expr::If {
            cond: Box::new(Expr::Bool { value: true, tag: t(0) }),
            then_branch: Box::new(branch(10)),
            else_branch: Box::new(branch(20)),
            tag: t(30),
        };
        assert_eq!(count_vars(&e), 1);
    }
}
