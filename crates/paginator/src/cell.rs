use tokio::sync::watch;

/// Observable value with a synchronous current read.
///
/// Writes always store the value, whether or not anyone is subscribed.
pub struct StateCell<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone> StateCell<T> {
    pub fn new(value: T) -> Self {
        let (tx, _rx) = watch::channel(value);
        Self { tx }
    }

    pub fn get(&self) -> T { self.tx.borrow().clone() }

    pub fn set(&self, value: T) { self.tx.send_replace(value); }

    pub fn subscribe(&self) -> watch::Receiver<T> { self.tx.subscribe() }
}
