/// Scheduler control used by timing critical loops.
pub trait Preemption {
    fn disable(&mut self);
    fn enable(&mut self);
}

/// Hosted builds have no scheduler lock to take.
impl Preemption for () {
    fn disable(&mut self) {}
    fn enable(&mut self) {}
}

/// A no-preemption span with an explicit step budget.
///
/// The budget is fixed on entry; every loop inside the section spends one
/// step per iteration and must stop once [`BoundedSection::step`] returns
/// `false`. Preemption is enabled again on drop.
pub struct BoundedSection<'a, P: Preemption + ?Sized> {
    preemption: &'a mut P,
    remaining: usize,
}

impl<'a, P: Preemption + ?Sized> BoundedSection<'a, P> {
    pub fn enter(preemption: &'a mut P, budget: usize) -> Self {
        log::trace!("enter bounded section, budget {budget}");
        preemption.disable();
        Self {
            preemption,
            remaining: budget,
        }
    }

    /// Spend one step. `false` once the budget is exhausted.
    pub fn step(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl<P: Preemption + ?Sized> Drop for BoundedSection<'_, P> {
    fn drop(&mut self) {
        self.preemption.enable();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct Counting {
        locked: bool,
        entries: usize,
    }

    impl Preemption for Counting {
        fn disable(&mut self) {
            assert!(!self.locked);
            self.locked = true;
            self.entries += 1;
        }
        fn enable(&mut self) {
            self.locked = false;
        }
    }

    #[test]
    fn budget_is_enforced() {
        let mut sched = Counting::default();
        {
            let mut section = BoundedSection::enter(&mut sched, 3);
            let mut steps = 0;
            while section.step() {
                steps += 1;
            }
            assert_eq!(steps, 3);
            assert_eq!(section.remaining(), 0);
        }
        assert!(!sched.locked);
        assert_eq!(sched.entries, 1);
    }
}
