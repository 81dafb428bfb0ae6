use tokio::sync::watch;

/// One-shot shutdown signal shared between a component's owner and its
/// spawned tasks. Triggering is idempotent; listeners created after the
/// trigger fired observe it immediately.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener { rx: self.tx.subscribe() }
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownListener {
    /// Resolves once the trigger fires. Also resolves if the trigger side is
    /// dropped, so orphaned tasks wind down instead of hanging.
    pub async fn wait(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        let _ = self.rx.wait_for(|fired| *fired).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_observes_trigger() {
        let trigger = ShutdownTrigger::new();
        let mut listener = trigger.listener();
        trigger.trigger();
        listener.wait().await;
        assert!(trigger.is_triggered());
    }

    #[tokio::test]
    async fn late_listener_sees_fired_state() {
        let trigger = ShutdownTrigger::new();
        trigger.trigger();
        let mut listener = trigger.listener();
        listener.wait().await;
    }
}
