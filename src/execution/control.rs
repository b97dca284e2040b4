use super::value::Value;
use crate::error::Trap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    Block,
    Loop,
    If,
}

/// An entered block. `cont` is where a branch to it continues and `arity`
/// how many values the branch carries; `results` is what falls through at
/// its `end`.
#[derive(Debug, Clone, Copy)]
pub struct Label {
    pub kind: LabelKind,
    pub cont: usize,
    pub sp: usize,
    pub arity: usize,
    pub results: usize,
}

impl Label {
    /// Label for a block whose parameters are already on the stack.
    pub fn enter(
        kind: LabelKind,
        cont: usize,
        stack: &[Value],
        (params, results): (usize, usize),
    ) -> Result<Self, Trap> {
        let sp = stack.len().checked_sub(params).ok_or(Trap::StackUnderflow)?;
        let arity = if kind == LabelKind::Loop { params } else { results };
        Ok(Self {
            kind,
            cont,
            sp,
            arity,
            results,
        })
    }
}

pub enum Branch {
    Jump(usize),
    /// Back-edge to the start of a loop.
    Loop(usize),
    Return,
}

/// Drops everything above `sp` except the top `arity` values.
pub fn stack_unwind(stack: &mut Vec<Value>, sp: usize, arity: usize) -> Result<(), Trap> {
    if stack.len() < sp + arity {
        return Err(Trap::StackUnderflow);
    }
    let top = stack.len() - arity;
    stack.drain(sp..top);
    Ok(())
}

/// Branches out of `depth + 1` labels. A depth past the outermost label
/// leaves the function.
pub fn branch(labels: &mut Vec<Label>, stack: &mut Vec<Value>, depth: u32) -> Result<Branch, Trap> {
    let depth = depth as usize;
    if depth >= labels.len() {
        return Ok(Branch::Return);
    }
    let idx = labels.len() - 1 - depth;
    let label = labels[idx];
    stack_unwind(stack, label.sp, label.arity)?;
    labels.truncate(idx);
    Ok(match label.kind {
        // the loop instruction re-enters its label
        LabelKind::Loop => Branch::Loop(label.cont),
        _ => Branch::Jump(label.cont),
    })
}

/// Closes the innermost label at its `end`. Returns false when no label was
/// open, that is the `end` of the function body.
pub fn end_block(labels: &mut Vec<Label>, stack: &mut Vec<Value>) -> Result<bool, Trap> {
    match labels.pop() {
        Some(label) => {
            stack_unwind(stack, label.sp, label.results)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::{Branch, Label, LabelKind, branch, end_block, stack_unwind};
    use crate::{error::Trap, execution::value::Value};
    use pretty_assertions::assert_eq;

    fn values(v: &[i32]) -> Vec<Value> {
        v.iter().copied().map(Value::I32).collect()
    }

    #[test]
    fn unwind_keeps_results_on_top() {
        let mut stack = values(&[1, 2, 3, 4]);
        stack_unwind(&mut stack, 1, 1).unwrap();
        assert_eq!(stack, values(&[1, 4]));

        let mut stack = values(&[1]);
        assert_eq!(stack_unwind(&mut stack, 1, 1), Err(Trap::StackUnderflow));
    }

    #[test]
    fn branch_to_block_and_loop() {
        let mut stack = values(&[9]);
        let mut labels = vec![
            Label::enter(LabelKind::Block, 20, &stack, (0, 1)).unwrap(),
        ];
        stack.push(Value::I32(5));
        labels.push(Label::enter(LabelKind::Loop, 3, &stack, (1, 0)).unwrap());
        stack.extend(values(&[6, 7]));

        // a loop label carries its params
        assert!(matches!(
            branch(&mut labels, &mut stack, 0).unwrap(),
            Branch::Loop(3)
        ));
        assert_eq!(stack, values(&[9, 7]));
        assert_eq!(labels.len(), 1);

        assert!(matches!(
            branch(&mut labels, &mut stack, 0).unwrap(),
            Branch::Jump(20)
        ));
        assert_eq!(stack, values(&[9, 7]));
        assert!(labels.is_empty());

        assert!(matches!(
            branch(&mut labels, &mut stack, 0).unwrap(),
            Branch::Return
        ));
    }

    #[test]
    fn end_block_restores_height() {
        let mut stack = values(&[1]);
        let mut labels = vec![Label::enter(LabelKind::If, 8, &stack, (0, 2)).unwrap()];
        stack.extend(values(&[2, 3, 4]));
        assert_eq!(end_block(&mut labels, &mut stack), Ok(true));
        assert_eq!(stack, values(&[1, 3, 4]));
        assert_eq!(end_block(&mut labels, &mut stack), Ok(false));
    }
}
