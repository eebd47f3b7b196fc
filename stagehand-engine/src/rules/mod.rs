// Rule engine for job inclusion
// Conditions are compiled once into predicate data, then evaluated per trigger

pub mod evaluator;
pub mod expression;
pub mod glob;
pub mod lexer;
pub mod predicate;

pub use evaluator::{JobDefaults, Rule, RuleEvaluator, RuleOutcome};
pub use expression::{compile, ExpressionError};
pub use predicate::{CompareOp, Operand, Predicate, RuleScope};
