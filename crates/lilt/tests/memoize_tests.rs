use std::rc::Rc;

use lilt::{Arity, Memoized, Reader, Typecode, Value, memoize_expression};
use pretty_assertions::assert_eq;

fn read(src: &str) -> Value {
    Reader::new(src, None).read_one().unwrap()
}

fn memo(src: &str) -> Rc<Memoized> {
    memoize_expression(&read(src)).expect("expression should memoize")
}

/// Renders through the un-memoizer, the most convenient structural view.
fn lowered(src: &str) -> String {
    lilt::unmemoize_expression(&memo(src)).to_string()
}

#[test]
fn atoms_quote_themselves() {
    assert_eq!(memo("42").typecode(), Typecode::Quote);
    assert_eq!(memo("\"s\"").typecode(), Typecode::Quote);
    assert_eq!(memo("#t").typecode(), Typecode::Quote);
    assert_eq!(memo("#:kw").typecode(), Typecode::Quote);
}

#[test]
fn free_symbols_become_toplevel_refs() {
    let node = memo("x");
    assert_eq!(node.typecode(), Typecode::ToplevelRef);
    assert!(matches!(&*node, Memoized::ToplevelRef { name, .. } if name.as_str() == "x"));
}

#[test]
fn if_lowers_with_quoted_branches() {
    let node = memo("(if #t 1 2)");
    let Memoized::If { test, then, alt } = &*node else {
        panic!("expected an if node");
    };
    assert!(matches!(&**test, Memoized::Quote { datum } if datum.equal(&Value::Bool(true))));
    assert!(matches!(&**then, Memoized::Quote { datum } if datum.equal(&Value::Int(1))));
    assert!(matches!(&**alt, Memoized::Quote { datum } if datum.equal(&Value::Int(2))));
}

#[test]
fn one_armed_if_fills_in_unspecified() {
    let node = memo("(if x 1)");
    let Memoized::If { alt, .. } = &*node else {
        panic!("expected an if node");
    };
    assert!(matches!(&**alt, Memoized::Quote { datum } if matches!(datum, Value::Unspecified)));
}

#[test]
fn calls_memoize_operator_and_operands() {
    let node = memo("(f 1 2 3)");
    let Memoized::Call { proc, args } = &*node else {
        panic!("expected a call node");
    };
    assert_eq!(proc.typecode(), Typecode::ToplevelRef);
    assert_eq!(args.len(), 3);
}

/// Lambda parameters resolve to frame indices: the last formal binds at
/// index 0.
#[test]
fn lambda_fixed_arity_and_indices() {
    let node = memo("(lambda (x y) (+ x y))");
    let Memoized::Lambda { body, arity } = &*node else {
        panic!("expected a lambda node");
    };
    assert!(matches!(arity, Arity::Fixed { nreq: 2 }));
    // Single body form passes through unwrapped.
    let Memoized::Call { proc, args } = &**body else {
        panic!("expected the body to be a call");
    };
    assert_eq!(proc.typecode(), Typecode::ToplevelRef);
    assert!(matches!(&*args[0], Memoized::LexicalRef { index: 1 }));
    assert!(matches!(&*args[1], Memoized::LexicalRef { index: 0 }));
}

#[test]
fn lambda_rest_arities() {
    assert!(matches!(
        &*memo("(lambda args args)"),
        Memoized::Lambda { arity: Arity::Rest { nreq: 0 }, .. }
    ));
    assert!(matches!(
        &*memo("(lambda (a . b) a)"),
        Memoized::Lambda { arity: Arity::Rest { nreq: 1 }, .. }
    ));
}

#[test]
fn lambda_multi_form_body_wraps_in_begin() {
    let node = memo("(lambda (x) x x)");
    let Memoized::Lambda { body, .. } = &*node else {
        panic!("expected a lambda node");
    };
    assert_eq!(body.typecode(), Typecode::Begin);
}

#[test]
fn begin_single_form_passes_through() {
    assert_eq!(memo("(begin 1)").typecode(), Typecode::Quote);
    assert_eq!(memo("(begin 1 2)").typecode(), Typecode::Begin);
}

#[test]
fn let_memoizes_inits_in_the_outer_scope() {
    assert_eq!(lowered("(let ((x 1) (y x)) (f x y))"), "(let ((_ '1) (_ x)) (f <1> <0>))");
}

#[test]
fn empty_let_is_just_the_body() {
    assert_eq!(memo("(let () 1)").typecode(), Typecode::Quote);
}

/// Named let: one undefined slot, the loop lambda stored by the first body
/// form, the seeding call made by the second.
#[test]
fn named_let_builds_the_loop_shape() {
    let node = memo("(let loop ((n 10)) (if (zero? n) 'done (loop (- n 1))))");
    let Memoized::Let { inits, body } = &*node else {
        panic!("expected a let node");
    };
    assert_eq!(inits.len(), 1);
    assert!(matches!(&*inits[0], Memoized::Quote { datum } if matches!(datum, Value::Undefined)));
    let Memoized::Begin { body } = &**body else {
        panic!("expected a begin body");
    };
    assert_eq!(body.len(), 2);
    let Memoized::LexicalSet { index: 0, value } = &*body[0] else {
        panic!("expected the loop binding assignment");
    };
    assert!(matches!(&**value, Memoized::Lambda { arity: Arity::Fixed { nreq: 1 }, .. }));
    let Memoized::Call { proc, args } = &*body[1] else {
        panic!("expected the seeding call");
    };
    assert!(matches!(&**proc, Memoized::LexicalRef { index: 0 }));
    assert_eq!(args.len(), 1);
    assert!(matches!(&*args[0], Memoized::Quote { datum } if datum.equal(&Value::Int(10))));
}

#[test]
fn let_star_nests_one_let_per_binding() {
    assert_eq!(
        lowered("(let* ((x 1) (y x)) y)"),
        "(let ((_ '1)) (let ((_ <0>)) <0>))"
    );
}

#[test]
fn letrec_allocates_then_copies_slots() {
    let node = memo("(letrec ((f (lambda () (f)))) (f))");
    let Memoized::Let { inits, body } = &*node else {
        panic!("expected the outer let");
    };
    assert_eq!(inits.len(), 1);
    let Memoized::Begin { body } = &**body else {
        panic!("expected a begin");
    };
    let Memoized::Let { inits: vals, body: sets } = &*body[0] else {
        panic!("expected the inner value let");
    };
    assert_eq!(vals.len(), 1);
    let Memoized::Begin { body: sets } = &**sets else {
        panic!("expected the copy sequence");
    };
    assert!(matches!(&*sets[0], Memoized::LexicalSet { index: 1, value }
        if matches!(&**value, Memoized::LexicalRef { index: 0 })));
}

#[test]
fn and_unfolds_to_ifs() {
    assert_eq!(memo("(and)").typecode(), Typecode::Quote);
    assert_eq!(memo("(and x)").typecode(), Typecode::ToplevelRef);
    assert_eq!(lowered("(and x y)"), "(if x y '#f)");
    assert_eq!(lowered("(and x y z)"), "(if x (if y z '#f) '#f)");
}

/// Every `or` operand binds a fresh temporary so it is tested and returned
/// without double evaluation.
#[test]
fn or_binds_each_operand_once() {
    assert_eq!(memo("(or)").typecode(), Typecode::Quote);
    assert_eq!(lowered("(or x)"), "(let ((_ x)) (if <0> <0> '#f))");
    assert_eq!(
        lowered("(or x y)"),
        "(let ((_ x)) (if <0> <0> (let ((_ y)) (if <0> <0> '#f))))"
    );
}

#[test]
fn cond_chains_ifs_with_unspecified_fallthrough() {
    assert_eq!(lowered("(cond (a 1) (b 2))"), "(if a '1 (if b '2 '#<unspecified>))");
}

#[test]
fn cond_else_clause_is_the_final_alternative() {
    assert_eq!(lowered("(cond (a 1) (else 'done))"), "(if a '1 'done)");
}

/// An arrow clause binds the test value and feeds it to the recipient;
/// the else clause lands in the inner alternative.
#[test]
fn cond_arrow_clause_feeds_the_recipient() {
    assert_eq!(
        lowered("(cond ((f x) => g) (else 'done))"),
        "(let ((_ (f x))) (if <0> (g <0>) 'done))"
    );
}

#[test]
fn cond_keywords_lose_magic_when_shadowed() {
    // With `else` lexically bound, the clause head is an ordinary variable.
    assert_eq!(
        lowered("(lambda (else) (cond (else 1)))"),
        "(lambda (_) (if <0> '1 '#<unspecified>))"
    );
}

#[test]
fn eval_when_keeps_or_drops_the_body() {
    assert_eq!(memo("(eval-when (eval) 1 2)").typecode(), Typecode::Begin);
    assert_eq!(memo("(eval-when (load) 1)").typecode(), Typecode::Begin);
    let dropped = memo("(eval-when (compile) 1)");
    assert!(matches!(&*dropped, Memoized::Quote { datum } if matches!(datum, Value::Unspecified)));
}

#[test]
fn with_fluids_preserves_binding_order() {
    let node = memo("(with-fluids ((a 1) (b 2)) 'body)");
    let Memoized::WithFluids { fluids, vals, body } = &*node else {
        panic!("expected a with-fluids node");
    };
    assert_eq!(fluids.len(), 2);
    assert_eq!(vals.len(), 2);
    assert!(matches!(&*fluids[0], Memoized::ToplevelRef { name, .. } if name.as_str() == "a"));
    assert!(matches!(&*vals[1], Memoized::Quote { datum } if datum.equal(&Value::Int(2))));
    assert_eq!(body.typecode(), Typecode::Quote);
}

#[test]
fn module_ref_forms() {
    let public = memo("(@ (ice-9 q) make-q)");
    assert!(matches!(&*public, Memoized::ModuleRef { public: true, name, .. }
        if name.as_str() == "make-q"));
    let private = memo("(@@ (ice-9 q) hidden)");
    assert!(matches!(&*private, Memoized::ModuleRef { public: false, .. }));
}

#[test]
fn set_bang_dispatches_on_the_target_kind() {
    assert!(matches!(&*memo("(set! x 1)"), Memoized::ToplevelSet { name, .. } if name.as_str() == "x"));
    assert_eq!(lowered("(lambda (x) (set! x 1))"), "(lambda (_) (set! <0> '1))");
    assert!(matches!(
        &*memo("(set! (@@ (m) x) 1)"),
        Memoized::ModuleSet { public: false, .. }
    ));
}

#[test]
fn define_at_toplevel() {
    let node = memo("(define foo 1)");
    let Memoized::Define { name, value } = &*node else {
        panic!("expected a define node");
    };
    assert_eq!(name.as_str(), "foo");
    assert_eq!(value.typecode(), Typecode::Quote);
}

#[test]
fn define_lambda_sugar() {
    let node = memo("(define (f x . rest) x)");
    let Memoized::Define { name, value } = &*node else {
        panic!("expected a define node");
    };
    assert_eq!(name.as_str(), "f");
    assert!(matches!(&**value, Memoized::Lambda { arity: Arity::Rest { nreq: 1 }, .. }));
}

#[test]
fn memoizer_primitives_emit_their_nodes() {
    assert_eq!(memo("(@apply f args)").typecode(), Typecode::Apply);
    assert_eq!(
        memo("(@call-with-current-continuation f)").typecode(),
        Typecode::CallCc
    );
    assert_eq!(memo("(@call-with-values p c)").typecode(), Typecode::CallWithValues);
    assert_eq!(memo("(@dynamic-wind in expr out)").typecode(), Typecode::Dynwind);
    assert_eq!(memo("(@prompt tag expr handler)").typecode(), Typecode::Prompt);
}

#[test]
fn lambda_star_optionals_and_keys() {
    let node = memo("(lambda* (a #:optional (b 1) #:key c) a)");
    let Memoized::Lambda { arity, .. } = &*node else {
        panic!("expected a lambda node");
    };
    let Arity::Full {
        nreq,
        rest,
        nopt,
        kw,
        inits,
        alternate,
    } = arity
    else {
        panic!("expected a full arity spec");
    };
    assert_eq!(*nreq, 1);
    assert!(!rest);
    assert_eq!(*nopt, 1);
    assert!(alternate.is_none());
    // One init per optional and keyword parameter.
    assert_eq!(inits.len(), 2);
    let kw = kw.as_ref().expect("keyword spec expected");
    assert!(!kw.allow_other_keys);
    // Keyword slots start after required, optional, and rest bindings.
    assert_eq!(kw.keywords.len(), 1);
    assert_eq!(kw.keywords[0].0.as_str(), "c");
    assert_eq!(kw.keywords[0].1, 2);
}

#[test]
fn lambda_star_rest_binds_before_keywords() {
    let node = memo("(lambda* (a #:key b #:rest r) a)");
    let Memoized::Lambda { arity, .. } = &*node else {
        panic!("expected a lambda node");
    };
    let Arity::Full { rest: true, kw: Some(kw), .. } = arity else {
        panic!("expected a full arity with a rest argument");
    };
    // Slot order: a, r, b — the keyword lands after the rest binding.
    assert_eq!(kw.keywords[0].1, 2);
}

#[test]
fn lambda_star_degrades_to_simple_arities() {
    assert!(matches!(
        &*memo("(lambda* (a b) a)"),
        Memoized::Lambda { arity: Arity::Fixed { nreq: 2 }, .. }
    ));
    assert!(matches!(
        &*memo("(lambda* (a . r) a)"),
        Memoized::Lambda { arity: Arity::Rest { nreq: 1 }, .. }
    ));
}

#[test]
fn lambda_star_default_inits_are_false() {
    let node = memo("(lambda* (#:optional o) o)");
    let Memoized::Lambda { arity: Arity::Full { inits, .. }, .. } = &*node else {
        panic!("expected a full arity spec");
    };
    assert!(matches!(&*inits[0], Memoized::Quote { datum } if datum.equal(&Value::Bool(false))));
}

#[test]
fn lambda_star_inits_see_earlier_parameters() {
    let node = memo("(lambda* (a #:optional (b a)) b)");
    let Memoized::Lambda { arity: Arity::Full { inits, .. }, .. } = &*node else {
        panic!("expected a full arity spec");
    };
    // `a` is in scope for b's init.
    assert!(matches!(&*inits[0], Memoized::LexicalRef { index: 0 }));
}

/// Clauses chain through the arity's alternate slot, first clause
/// outermost, so dispatch tries them left to right.
#[test]
fn case_lambda_chains_clauses() {
    let node = memo("(case-lambda ((a) 1) ((a b) 2))");
    let Memoized::Lambda { arity: Arity::Full { nreq: 1, alternate: Some(alt), .. }, .. } = &*node
    else {
        panic!("expected the first clause outermost");
    };
    let Memoized::Lambda { arity: Arity::Full { nreq: 2, alternate: None, .. }, .. } = &**alt
    else {
        panic!("expected the second clause chained");
    };
}

#[test]
fn shadowed_special_forms_are_ordinary_calls() {
    // `if` bound lexically is just a variable.
    let node = memo("(lambda (if) (if 1 2 3))");
    let Memoized::Lambda { body, .. } = &*node else {
        panic!("expected a lambda node");
    };
    let Memoized::Call { proc, args } = &**body else {
        panic!("expected the shadowed form to be a call");
    };
    assert!(matches!(&**proc, Memoized::LexicalRef { index: 0 }));
    assert_eq!(args.len(), 3);
}

/// Every tag in the fixed vocabulary is reachable from source.
#[test]
fn all_nineteen_tags_are_produced() {
    let samples: [(&str, Typecode); 19] = [
        ("(begin 1 2)", Typecode::Begin),
        ("(if a b c)", Typecode::If),
        ("(lambda (x) x)", Typecode::Lambda),
        ("(let ((x 1)) x)", Typecode::Let),
        ("'x", Typecode::Quote),
        ("(define x 1)", Typecode::Define),
        ("(@dynamic-wind a b c)", Typecode::Dynwind),
        ("(with-fluids ((f 1)) 2)", Typecode::WithFluids),
        ("(@apply f args)", Typecode::Apply),
        ("(@call-with-current-continuation k)", Typecode::CallCc),
        ("(@call-with-values p c)", Typecode::CallWithValues),
        ("(f x)", Typecode::Call),
        ("x", Typecode::ToplevelRef),
        ("(set! x 1)", Typecode::ToplevelSet),
        ("(@ (m) x)", Typecode::ModuleRef),
        ("(set! (@ (m) x) 1)", Typecode::ModuleSet),
        ("(@prompt t e h)", Typecode::Prompt),
        // Lexical references only occur under a binder; dig them out.
        ("(lambda (x) x)", Typecode::Lambda),
        ("(lambda (x) (set! x 1))", Typecode::Lambda),
    ];
    let mut seen = std::collections::BTreeSet::new();
    for (src, expected) in samples {
        let node = memo(src);
        assert_eq!(node.typecode(), expected, "for {src}");
        seen.insert(node.typecode().code());
    }
    let body_ref = memo("(lambda (x) x)");
    if let Memoized::Lambda { body, .. } = &*body_ref {
        seen.insert(body.typecode().code());
        assert_eq!(body.typecode(), Typecode::LexicalRef);
    }
    let body_set = memo("(lambda (x) (set! x 1))");
    if let Memoized::Lambda { body, .. } = &*body_set {
        seen.insert(body.typecode().code());
        assert_eq!(body.typecode(), Typecode::LexicalSet);
    }
    assert_eq!(seen.len(), 19);
}

#[test]
fn source_is_not_mutated_by_memoization() {
    let expr = read("(let ((x 1)) (if x 'a 'b))");
    let before = expr.to_string();
    memoize_expression(&expr).unwrap();
    assert_eq!(expr.to_string(), before);
}
