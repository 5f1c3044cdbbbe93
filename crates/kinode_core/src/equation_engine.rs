use crate::error::{Result, SimulationError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// OpCodes for the stack-based virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OpCode {
    /// Pushes a constant value onto the stack.
    LoadConst(f64),
    /// Pushes the value of a state variable (by species index).
    LoadVar(usize),
    /// Pushes the value of a parameter (by index into the compiled parameter list).
    LoadParam(usize),
    /// Pushes the current time.
    LoadTime,
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    Sin,
    Cos,
    Exp,
    Ln,
    Sqrt,
    /// Pops top value (a), pushes -a.
    Neg,
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

/// Stack-based virtual machine for evaluating compiled right-hand sides.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: instructions to run.
/// - `t`: current time.
/// - `vars`: current state vector.
/// - `params`: resolved parameter values, in compiled order.
/// - `stack`: a scratch buffer for intermediate values.
///
/// Returns `None` if the bytecode does not leave exactly one value on the stack.
pub struct VM;

impl VM {
    pub fn execute(
        bytecode: &Bytecode,
        t: f64,
        vars: &[f64],
        params: &[f64],
        stack: &mut Vec<f64>,
    ) -> Option<f64> {
        stack.clear();

        for op in &bytecode.ops {
            match op {
                OpCode::LoadConst(val) => stack.push(*val),
                OpCode::LoadVar(idx) => stack.push(*vars.get(*idx)?),
                OpCode::LoadParam(idx) => stack.push(*params.get(*idx)?),
                OpCode::LoadTime => stack.push(t),
                OpCode::Add => binary(stack, |a, b| a + b)?,
                OpCode::Sub => binary(stack, |a, b| a - b)?,
                OpCode::Mul => binary(stack, |a, b| a * b)?,
                OpCode::Div => binary(stack, |a, b| a / b)?,
                OpCode::Pow => binary(stack, f64::powf)?,
                OpCode::Sin => unary(stack, f64::sin)?,
                OpCode::Cos => unary(stack, f64::cos)?,
                OpCode::Exp => unary(stack, f64::exp)?,
                OpCode::Ln => unary(stack, f64::ln)?,
                OpCode::Sqrt => unary(stack, f64::sqrt)?,
                OpCode::Neg => unary(stack, |a| -a)?,
            }
        }

        let result = stack.pop()?;
        stack.is_empty().then_some(result)
    }
}

fn binary(stack: &mut Vec<f64>, f: impl Fn(f64, f64) -> f64) -> Option<()> {
    let b = stack.pop()?;
    let a = stack.pop()?;
    stack.push(f(a, b));
    Some(())
}

fn unary(stack: &mut Vec<f64>, f: impl Fn(f64) -> f64) -> Option<()> {
    let a = stack.pop()?;
    stack.push(f(a));
    Some(())
}

// --- AST ---

/// Expression tree handed over by the definition layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Number(f64),
    /// A species name, `t`, or a parameter name.
    Symbol(String),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Neg(Box<Expr>),
    Call(Function, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Function {
    Sin,
    Cos,
    Exp,
    Ln,
    Sqrt,
}

impl Expr {
    pub fn num(value: f64) -> Self {
        Expr::Number(value)
    }

    pub fn sym(name: &str) -> Self {
        Expr::Symbol(name.to_string())
    }

    pub fn binary(lhs: Expr, op: BinaryOp, rhs: Expr) -> Self {
        Expr::Binary(Box::new(lhs), op, Box::new(rhs))
    }

    pub fn add(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(lhs, BinaryOp::Add, rhs)
    }

    pub fn sub(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(lhs, BinaryOp::Sub, rhs)
    }

    pub fn mul(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(lhs, BinaryOp::Mul, rhs)
    }

    pub fn div(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(lhs, BinaryOp::Div, rhs)
    }

    pub fn neg(inner: Expr) -> Self {
        Expr::Neg(Box::new(inner))
    }

    pub fn call(func: Function, arg: Expr) -> Self {
        Expr::Call(func, Box::new(arg))
    }
}

/// Name reserved for the independent variable.
pub const TIME_SYMBOL: &str = "t";

/// Compiles expression trees into `Bytecode`.
///
/// Species names resolve to state loads, `t` to the time, and every other
/// symbol is registered as a parameter in first-appearance order.
pub struct Compiler {
    var_map: HashMap<String, usize>,
    param_map: HashMap<String, usize>,
    param_names: Vec<String>,
}

impl Compiler {
    pub fn new(var_names: &[String]) -> Self {
        let var_map = var_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        Self {
            var_map,
            param_map: HashMap::new(),
            param_names: Vec::new(),
        }
    }

    pub fn compile(&mut self, expr: &Expr) -> Bytecode {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops);
        Bytecode { ops }
    }

    /// Parameter names referenced so far, in the order `LoadParam` indexes them.
    pub fn into_param_names(self) -> Vec<String> {
        self.param_names
    }

    fn compile_recursive(&mut self, expr: &Expr, ops: &mut Vec<OpCode>) {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Symbol(name) => {
                if let Some(&idx) = self.var_map.get(name) {
                    ops.push(OpCode::LoadVar(idx));
                } else if name == TIME_SYMBOL {
                    ops.push(OpCode::LoadTime);
                } else {
                    let idx = self.param_index(name);
                    ops.push(OpCode::LoadParam(idx));
                }
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops);
                self.compile_recursive(right, ops);
                ops.push(match op {
                    BinaryOp::Add => OpCode::Add,
                    BinaryOp::Sub => OpCode::Sub,
                    BinaryOp::Mul => OpCode::Mul,
                    BinaryOp::Div => OpCode::Div,
                    BinaryOp::Pow => OpCode::Pow,
                });
            }
            Expr::Neg(operand) => {
                self.compile_recursive(operand, ops);
                ops.push(OpCode::Neg);
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops);
                ops.push(match func {
                    Function::Sin => OpCode::Sin,
                    Function::Cos => OpCode::Cos,
                    Function::Exp => OpCode::Exp,
                    Function::Ln => OpCode::Ln,
                    Function::Sqrt => OpCode::Sqrt,
                });
            }
        }
    }

    fn param_index(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.param_map.get(name) {
            return idx;
        }
        let idx = self.param_names.len();
        self.param_map.insert(name.to_string(), idx);
        self.param_names.push(name.to_string());
        idx
    }
}

// --- EquationSystem ---

/// One compiled bytecode expression per species plus the parameter names they read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquationSystem {
    pub equations: Vec<Bytecode>,
    pub param_names: Vec<String>,
}

impl EquationSystem {
    /// Compiles one expression per species, in species order.
    pub fn compile(species: &[String], expressions: &[Expr]) -> Result<Self> {
        if expressions.len() != species.len() {
            return Err(SimulationError::shape(
                "Expression count",
                species.len(),
                expressions.len(),
            ));
        }
        let mut compiler = Compiler::new(species);
        let equations = expressions.iter().map(|e| compiler.compile(e)).collect();
        Ok(Self {
            equations,
            param_names: compiler.into_param_names(),
        })
    }

    /// Evaluates every equation into `out` with parameters already resolved.
    pub fn apply(
        &self,
        t: f64,
        x: &[f64],
        params: &[f64],
        stack: &mut Vec<f64>,
        out: &mut [f64],
    ) -> Result<()> {
        for (slot, eq) in out.iter_mut().zip(&self.equations) {
            *slot = VM::execute(eq, t, x, params, stack)
                .ok_or(SimulationError::MalformedExpression)?;
        }
        Ok(())
    }
}
