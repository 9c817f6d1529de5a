//! Free-list object pool for the sequencer hot path.

type Create<T> = Box<dyn Fn() -> T + Send>;
type Reset<T> = Box<dyn Fn(&mut T) + Send>;

/// A pool for reusing mutable objects to reduce allocations in hot paths.
///
/// The free list is filled with `initial_size` instances up front.
/// [`borrow`](Self::borrow) pops an instance (or creates one when the list
/// is empty) and [`release`](Self::release) applies the reset function
/// before pushing it back. The API takes `&mut self`: the pool belongs to
/// the single sequencer thread and is never shared.
pub struct ObjectPool<T> {
    free: Vec<T>,
    create: Create<T>,
    reset: Reset<T>,
    borrowed: usize,
    created: usize,
}

impl<T> ObjectPool<T> {
    /// Creates a pool pre-populated with `initial_size` instances.
    pub fn new<C, F>(create: C, reset: F, initial_size: usize) -> Self
    where
        C: Fn() -> T + Send + 'static,
        F: Fn(&mut T) + Send + 'static,
    {
        let free: Vec<T> = (0..initial_size).map(|_| create()).collect();
        Self {
            free,
            create: Box::new(create),
            reset: Box::new(reset),
            borrowed: 0,
            created: initial_size,
        }
    }

    /// Takes an instance from the pool, creating one if the pool is empty.
    pub fn borrow(&mut self) -> T {
        self.borrowed += 1;
        match self.free.pop() {
            Some(obj) => obj,
            None => {
                self.created += 1;
                (self.create)()
            }
        }
    }

    /// Takes an instance and applies `init` to it before handing it out.
    pub fn borrow_with<I>(&mut self, init: I) -> T
    where
        I: FnOnce(&mut T),
    {
        let mut obj = self.borrow();
        init(&mut obj);
        obj
    }

    /// Resets `obj` and returns it to the free list.
    pub fn release(&mut self, mut obj: T) {
        (self.reset)(&mut obj);
        self.borrowed = self.borrowed.saturating_sub(1);
        self.free.push(obj);
    }

    /// Number of instances handed out and not yet released.
    #[must_use]
    pub fn borrowed_count(&self) -> usize {
        self.borrowed
    }

    /// Number of idle instances in the free list.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.free.len()
    }

    /// Total instances ever created by this pool.
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.created
    }
}

impl<T> std::fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("pool_size", &self.free.len())
            .field("borrowed", &self.borrowed)
            .field("created", &self.created)
            .finish()
    }
}
