use super::VisitMut;
use hcl::{Expression, Operation};

/// Recursively visit every function call expression mutably
///
/// The walk is bottom-up: a call's arguments are visited before the call
/// itself, so a visitor that replaces calls sees nested calls already
/// resolved. The visitor receives the whole [Expression] so it can swap the
/// call for a different expression kind entirely.
///
/// Calls buried inside string templates are not visited; template contents
/// are opaque at this level.
pub trait VisitFuncCallsMut {
    fn visit_func_calls_mut(&mut self, visitor: &mut dyn VisitMut<Expression>);
}

impl VisitFuncCallsMut for Expression {
    fn visit_func_calls_mut(&mut self, visitor: &mut dyn VisitMut<Expression>) {
        match self {
            Expression::FuncCall(call) => {
                for arg in &mut call.args {
                    arg.visit_func_calls_mut(visitor);
                }
                visitor.visit_mut(self);
            }
            Expression::Array(array) => {
                for expr in array {
                    expr.visit_func_calls_mut(visitor);
                }
            }
            Expression::Object(object) => {
                for value in object.values_mut() {
                    value.visit_func_calls_mut(visitor);
                }
            }
            Expression::Parenthesis(expr) => {
                expr.visit_func_calls_mut(visitor);
            }
            Expression::Conditional(cond) => {
                cond.cond_expr.visit_func_calls_mut(visitor);
                cond.true_expr.visit_func_calls_mut(visitor);
                cond.false_expr.visit_func_calls_mut(visitor);
            }
            Expression::Operation(operation) => match operation.as_mut() {
                Operation::Binary(binop) => {
                    binop.lhs_expr.visit_func_calls_mut(visitor);
                    binop.rhs_expr.visit_func_calls_mut(visitor);
                }
                Operation::Unary(unop) => {
                    unop.expr.visit_func_calls_mut(visitor);
                }
            },
            Expression::ForExpr(forexpr) => {
                forexpr
                    .cond_expr
                    .iter_mut()
                    .for_each(|e| e.visit_func_calls_mut(visitor));
                forexpr
                    .key_expr
                    .iter_mut()
                    .for_each(|e| e.visit_func_calls_mut(visitor));
                forexpr.value_expr.visit_func_calls_mut(visitor);
                forexpr.collection_expr.visit_func_calls_mut(visitor);
            }
            Expression::Traversal(traversal) => {
                traversal.expr.visit_func_calls_mut(visitor);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn visits_nested_calls_bottom_up() {
        let mut expr: Expression = hcl::expr::FuncCall::builder("outer")
            .arg(hcl::expr::FuncCall::builder("inner").build())
            .build()
            .into();

        let mut seen = Vec::new();
        let mut collector = |expression: &mut Expression| {
            if let Expression::FuncCall(call) = expression {
                seen.push(call.name.to_string());
            }
        };
        expr.visit_func_calls_mut(&mut collector);

        assert_eq!(seen, vec!["inner".to_string(), "outer".to_string()]);
    }

    #[test]
    fn replacing_a_call_is_possible() {
        let mut expr: Expression = hcl::expr::FuncCall::builder("greet")
            .arg("Peter")
            .build()
            .into();

        let mut rewriter = |expression: &mut Expression| {
            *expression = Expression::String("Hello, Peter.".to_string());
        };
        expr.visit_func_calls_mut(&mut rewriter);

        assert_eq!(expr, Expression::String("Hello, Peter.".to_string()));
    }
}
