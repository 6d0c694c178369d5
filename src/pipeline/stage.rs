//! The stage capability shared by every pipeline component.
//!
//! A stage accepts one unit of input and may hand zero or more units of
//! output to the next stage. Stages never poll and never block: partial
//! state is kept until a later input completes it.

use std::marker::PhantomData;
use std::sync::Arc;

/// Inbound operation of a pipeline stage.
pub trait Consumer<T>: Send + Sync {
    fn accept(&self, input: T);
}

impl<T, C: Consumer<T> + ?Sized> Consumer<T> for Arc<C> {
    fn accept(&self, input: T) {
        (**self).accept(input)
    }
}

/// Adapts a closure into a [`Consumer`].
pub struct FnConsumer<F, T> {
    f: F,
    _input: PhantomData<fn(T)>,
}

impl<F, T> FnConsumer<F, T>
where
    F: Fn(T) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _input: PhantomData,
        }
    }
}

impl<F, T> Consumer<T> for FnConsumer<F, T>
where
    F: Fn(T) + Send + Sync,
{
    fn accept(&self, input: T) {
        (self.f)(input)
    }
}

/// Boxed closure consumer, convenient when wiring stages by hand.
pub fn consumer_fn<T, F>(f: F) -> Arc<dyn Consumer<T>>
where
    T: 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    Arc::new(FnConsumer::new(f))
}

/// Terminal stage that discards its input.
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl<T> Consumer<T> for Discard {
    fn accept(&self, _input: T) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_fn_consumer_forwards() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            consumer_fn(move |x: u32| seen.lock().push(x))
        };
        sink.accept(1);
        sink.accept(2);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_discard() {
        Discard.accept("ignored");
    }
}
