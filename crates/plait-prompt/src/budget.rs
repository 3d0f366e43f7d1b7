/// Characters-to-tokens approximation: `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// A shrinking token allowance. `consumed` never exceeds `max_tokens`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetManager {
    max_tokens: u64,
    consumed: u64,
}

impl BudgetManager {
    pub fn new(max_tokens: u64) -> Self {
        Self {
            max_tokens,
            consumed: 0,
        }
    }

    pub fn has_any(&self) -> bool {
        self.consumed < self.max_tokens
    }

    /// Whether `tokens` more would still fit.
    pub fn fits(&self, tokens: u64) -> bool {
        self.consumed.saturating_add(tokens) <= self.max_tokens
    }

    /// Reserve `tokens` if they fit; otherwise leave state unchanged.
    pub fn try_reserve(&mut self, tokens: u64) -> bool {
        if !self.fits(tokens) {
            return false;
        }
        self.consumed += tokens;
        true
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn max_tokens(&self) -> u64 {
        self.max_tokens
    }

    pub fn remaining(&self) -> u64 {
        self.max_tokens - self.consumed
    }
}

/// The global budget plus a stack of node-level ceilings.
///
/// Depth 0 is the global budget; each pushed scope sits one level deeper.
/// A reservation must fit every level and is charged to every level.
pub(crate) struct ScopedBudget<'a> {
    global: &'a mut BudgetManager,
    scopes: Vec<BudgetManager>,
}

impl<'a> ScopedBudget<'a> {
    pub(crate) fn new(global: &'a mut BudgetManager) -> Self {
        Self {
            global,
            scopes: Vec::new(),
        }
    }

    /// Depth of the innermost active level.
    pub(crate) fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub(crate) fn push(&mut self, ceiling: u64) {
        self.scopes.push(BudgetManager::new(ceiling));
    }

    pub(crate) fn pop(&mut self) {
        self.scopes.pop();
    }

    /// Reserve across all levels, innermost checked first.
    /// On failure returns the depth of the level that could not fit.
    pub(crate) fn try_reserve(&mut self, tokens: u64) -> Result<(), usize> {
        for (idx, scope) in self.scopes.iter().enumerate().rev() {
            if !scope.fits(tokens) {
                return Err(idx + 1);
            }
        }
        if !self.global.fits(tokens) {
            return Err(0);
        }
        for scope in &mut self.scopes {
            scope.try_reserve(tokens);
        }
        self.global.try_reserve(tokens);
        Ok(())
    }
}
