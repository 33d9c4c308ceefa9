//! Register allocation for values on the symbolic stack.
//!
//! Registers are handed out as move-only leases. A lease is returned by
//! passing it back to [`RegisterAllocator::release`]; it cannot be cloned,
//! so a register is never released twice or held by two stack entries.

use std::fmt::Debug;

/// Ownership of one register until it is released.
#[must_use = "a lease must be released or stored on the symbolic stack"]
#[derive(Debug, PartialEq, Eq)]
pub struct Lease<R> {
    reg: R,
    fallback: bool,
}

impl<R: Copy> Lease<R> {
    pub fn reg(&self) -> R {
        self.reg
    }

    /// True when the pools were exhausted and this lease aliases the
    /// fallback register. The compilation it belongs to is already failed.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }
}

/// Two-tier free list: the primary pool is used first, the auxiliary pool
/// only once the primary one is empty.
#[derive(Debug)]
pub struct RegisterAllocator<R> {
    /// Free registers, next one to hand out last.
    primary: Vec<R>,
    aux: Vec<R>,
    /// Every pooled register; the first `split` are primary.
    order: Vec<R>,
    split: usize,
    live: Vec<R>,
    fallback: R,
    failed: bool,
}

impl<R: Copy + Eq + Debug> RegisterAllocator<R> {
    pub fn new(primary: &[R], aux: &[R], fallback: R) -> Self {
        Self {
            primary: primary.iter().rev().copied().collect(),
            aux: aux.iter().rev().copied().collect(),
            order: primary.iter().chain(aux).copied().collect(),
            split: primary.len(),
            live: Vec::new(),
            fallback,
            failed: false,
        }
    }

    /// Takes a free register. When both pools are empty the fallback
    /// register is returned and the allocator is marked failed.
    pub fn acquire(&mut self) -> Lease<R> {
        match self.primary.pop().or_else(|| self.aux.pop()) {
            Some(reg) => {
                self.live.push(reg);
                Lease {
                    reg,
                    fallback: false,
                }
            }
            None => {
                self.failed = true;
                Lease {
                    reg: self.fallback,
                    fallback: true,
                }
            }
        }
    }

    /// Returns a register to the pool it came from.
    pub fn release(&mut self, lease: Lease<R>) {
        if lease.fallback {
            return;
        }
        let reg = lease.reg;
        self.live.retain(|&r| r != reg);
        match self.order.iter().position(|&r| r == reg) {
            Some(rank) if rank < self.split => self.primary.push(reg),
            Some(_) => self.aux.push(reg),
            None => {}
        }
    }

    pub fn is_live(&self, reg: R) -> bool {
        self.live.contains(&reg)
    }

    /// Leased registers in pool order.
    pub fn live(&self) -> Vec<R> {
        self.order
            .iter()
            .copied()
            .filter(|r| self.live.contains(r))
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn failed(&self) -> bool {
        self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc() -> RegisterAllocator<u8> {
        RegisterAllocator::new(&[1, 2], &[7], 0)
    }

    #[test]
    fn test_primary_before_aux() {
        let mut regs = alloc();
        let a = regs.acquire();
        let b = regs.acquire();
        let c = regs.acquire();
        assert_eq!((a.reg(), b.reg(), c.reg()), (1, 2, 7));
        assert_eq!(regs.live(), vec![1, 2, 7]);
        regs.release(b);
        assert_eq!(regs.acquire().reg(), 2);
        regs.release(a);
        regs.release(c);
    }

    #[test]
    fn test_released_register_returns_to_its_pool() {
        let mut regs = alloc();
        let a = regs.acquire();
        let b = regs.acquire();
        let c = regs.acquire();
        regs.release(c);
        regs.release(a);
        // primary registers are preferred again
        let d = regs.acquire();
        assert_eq!(d.reg(), 1);
        let e = regs.acquire();
        assert_eq!(e.reg(), 7);
        for lease in [b, d, e] {
            regs.release(lease);
        }
        assert_eq!(regs.live_count(), 0);
    }

    #[test]
    fn test_exhaustion_marks_failed() {
        let mut regs = alloc();
        let leases: Vec<_> = (0..3).map(|_| regs.acquire()).collect();
        assert!(!regs.failed());
        let extra = regs.acquire();
        assert!(extra.is_fallback());
        assert_eq!(extra.reg(), 0);
        assert!(regs.failed());
        regs.release(extra);
        assert_eq!(regs.live_count(), 3);
        for lease in leases {
            regs.release(lease);
        }
        assert!(!regs.is_live(1));
    }
}
