use std::sync::Arc;

use crate::code::CodeBlock;

/// A constant in a code block's constant pool
///
/// Besides literals, a pool holds the code blocks of every function, lambda
/// and class body defined inside the block.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// None/null literal
    None,

    /// Boolean literal
    Bool(bool),

    /// Integer literal
    Int(i64),

    /// Float literal
    Float(f64),

    /// String literal
    String(String),

    /// Body of a nested function
    Code(Arc<CodeBlock>),
}

impl Constant {
    pub fn as_code(&self) -> Option<&Arc<CodeBlock>> {
        match self {
            Constant::Code(code) => Some(code),
            _ => None,
        }
    }
}

/// Constant pool of a single code block
///
/// Constants are accessed by index (u16) from bytecode instructions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstantPool {
    constants: Vec<Constant>,
}

impl ConstantPool {
    /// Create a new empty constant pool
    pub fn new() -> Self {
        ConstantPool {
            constants: Vec::new(),
        }
    }

    /// Create a constant pool from a vector of constants
    pub fn from_vec(constants: Vec<Constant>) -> Self {
        ConstantPool { constants }
    }

    /// Add a constant to the pool and return its index
    pub fn add(&mut self, constant: Constant) -> u16 {
        match self.try_add(constant) {
            Some(index) => index,
            None => panic!("Constant pool overflow: too many constants"),
        }
    }

    /// Add a constant unless the pool is full
    ///
    /// Indices are u16 operands, so a pool holds at most `u16::MAX`
    /// constants.
    pub fn try_add(&mut self, constant: Constant) -> Option<u16> {
        let index = u16::try_from(self.constants.len())
            .ok()
            .filter(|&index| index < u16::MAX)?;
        self.constants.push(constant);
        Some(index)
    }

    /// Get a constant by index
    pub fn get(&self, index: u16) -> Option<&Constant> {
        self.constants.get(index as usize)
    }

    /// Get the number of constants in the pool
    pub fn len(&self) -> usize {
        self.constants.len()
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Constant> {
        self.constants.iter()
    }

    /// Code blocks directly nested in this pool
    pub fn code_blocks(&self) -> impl Iterator<Item = &Arc<CodeBlock>> {
        self.constants.iter().filter_map(Constant::as_code)
    }

    /// A copy of this pool with every nested code block passed through `f`
    ///
    /// `f` returns `None` to keep a block as it is.
    pub fn map_code_blocks<F>(&self, mut f: F) -> Self
    where
        F: FnMut(&Arc<CodeBlock>) -> Option<Arc<CodeBlock>>,
    {
        let constants = self
            .constants
            .iter()
            .map(|constant| match constant {
                Constant::Code(code) => Constant::Code(f(code).unwrap_or_else(|| code.clone())),
                other => other.clone(),
            })
            .collect();
        ConstantPool { constants }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_pool_basic() {
        let mut pool = ConstantPool::new();

        let idx1 = pool.add(Constant::Int(42));
        let idx2 = pool.add(Constant::String("hello".to_string()));
        let idx3 = pool.add(Constant::Code(Arc::new(CodeBlock::default())));

        assert_eq!(idx1, 0);
        assert_eq!(idx2, 1);
        assert_eq!(idx3, 2);
        assert_eq!(pool.len(), 3);

        assert_eq!(pool.get(idx1), Some(&Constant::Int(42)));
        assert_eq!(pool.get(idx2), Some(&Constant::String("hello".to_string())));
        assert!(pool.get(idx3).and_then(Constant::as_code).is_some());
        assert!(pool.get(7).is_none());
    }

    #[test]
    fn test_try_add_stops_at_capacity() {
        let mut pool = ConstantPool::from_vec(vec![Constant::None; u16::MAX as usize - 1]);
        assert_eq!(pool.try_add(Constant::Int(1)), Some(u16::MAX - 1));
        assert_eq!(pool.try_add(Constant::Int(2)), None);
        assert_eq!(pool.len(), u16::MAX as usize);
    }

    #[test]
    fn test_code_blocks() {
        let inner = Arc::new(CodeBlock {
            name: "inner".to_string(),
            ..CodeBlock::default()
        });
        let pool = ConstantPool::from_vec(vec![
            Constant::None,
            Constant::Code(inner.clone()),
            Constant::Int(1),
        ]);

        let nested: Vec<_> = pool.code_blocks().collect();
        assert_eq!(nested.len(), 1);
        assert!(Arc::ptr_eq(nested[0], &inner));
    }

    #[test]
    fn test_map_code_blocks_keeps_literals() {
        let inner = Arc::new(CodeBlock::default());
        let pool = ConstantPool::from_vec(vec![
            Constant::String("doc".to_string()),
            Constant::Code(inner.clone()),
        ]);

        let renamed = pool.map_code_blocks(|code| {
            Some(Arc::new(CodeBlock {
                name: "renamed".to_string(),
                ..(**code).clone()
            }))
        });
        assert_eq!(renamed.get(0), Some(&Constant::String("doc".to_string())));
        assert_eq!(renamed.code_blocks().next().map(|c| c.name.as_str()), Some("renamed"));

        let untouched = pool.map_code_blocks(|_| None);
        assert!(Arc::ptr_eq(untouched.code_blocks().next().unwrap(), &inner));
    }
}
