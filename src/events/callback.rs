use std::fmt;
use std::sync::Arc;

/// Function pointers compare by address, keyed closures by their key.
#[derive(Clone)]
pub enum Callback {
    Plain(fn()),
    WithChannel(fn(&str)),
    Keyed {
        key: String,
        func: Arc<dyn Fn(&str) + Send + Sync>,
    },
}

impl Callback {
    pub fn plain(func: fn()) -> Self {
        Callback::Plain(func)
    }

    pub fn with_channel(func: fn(&str)) -> Self {
        Callback::WithChannel(func)
    }

    pub fn keyed<F>(key: impl Into<String>, func: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Callback::Keyed {
            key: key.into(),
            func: Arc::new(func),
        }
    }

    pub fn invoke(&self, channel_id: &str) {
        match self {
            Callback::Plain(f) => f(),
            Callback::WithChannel(f) => f(channel_id),
            Callback::Keyed { func, .. } => func(channel_id),
        }
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Callback::Plain(a), Callback::Plain(b)) => std::ptr::fn_addr_eq(*a, *b),
            (Callback::WithChannel(a), Callback::WithChannel(b)) => std::ptr::fn_addr_eq(*a, *b),
            (Callback::Keyed { key: a, .. }, Callback::Keyed { key: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Eq for Callback {}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Plain(func) => f.debug_tuple("Plain").field(&(*func as *const ())).finish(),
            Callback::WithChannel(func) => f
                .debug_tuple("WithChannel")
                .field(&(*func as *const ()))
                .finish(),
            Callback::Keyed { key, .. } => f.debug_struct("Keyed").field("key", key).finish(),
        }
    }
}

impl From<fn()> for Callback {
    fn from(func: fn()) -> Self {
        Callback::Plain(func)
    }
}

impl From<fn(&str)> for Callback {
    fn from(func: fn(&str)) -> Self {
        Callback::WithChannel(func)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn first() {}
    fn second() {}
    fn named(_: &str) {}

    #[test]
    fn function_pointers_compare_by_address() {
        assert_eq!(Callback::plain(first), Callback::plain(first));
        assert_ne!(Callback::plain(first), Callback::plain(second));
        assert_eq!(Callback::with_channel(named), Callback::with_channel(named));
    }

    #[test]
    fn keyed_closures_compare_by_key_only() {
        let hits = Arc::new(AtomicUsize::new(0));
        let a = {
            let hits = hits.clone();
            Callback::keyed("counter", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        let b = Callback::keyed("counter", |_| {});
        let c = Callback::keyed("other", |_| {});

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, Callback::plain(first));

        a.invoke("18");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
