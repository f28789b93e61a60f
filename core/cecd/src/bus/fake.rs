//! In-memory adapter for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{BusAdapter, HandlerRegistry};
use crate::cec::CecFrame;
use crate::error::{ConnectionError, TransmitError};

#[derive(Default)]
struct FakeState {
    sent: Vec<String>,
    transmit_errors: VecDeque<TransmitError>,
    opens: usize,
    closes: usize,
    failing_opens: usize,
}

/// Handle shared between a test and the adapter it hands to the connection.
#[derive(Clone, Default)]
pub struct FakeBus {
    state: Arc<Mutex<FakeState>>,
}

struct FakeAdapter {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adapter(&self) -> Box<dyn BusAdapter> {
        Box::new(FakeAdapter {
            state: Arc::clone(&self.state),
        })
    }

    pub fn sent(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn push_transmit_error(&self, error: TransmitError) {
        self.state.lock().unwrap().transmit_errors.push_back(error);
    }

    pub fn fail_opens(&self, count: usize) {
        self.state.lock().unwrap().failing_opens = count;
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }
}

impl BusAdapter for FakeAdapter {
    fn open(&mut self, _registry: Arc<HandlerRegistry>) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().unwrap();
        state.opens += 1;
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(ConnectionError::Unavailable("fake adapter offline".to_string()));
        }
        Ok(())
    }

    fn transmit(&mut self, frame: &CecFrame) -> Result<(), TransmitError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.transmit_errors.pop_front() {
            return Err(error);
        }
        state.sent.push(frame.to_string());
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.closes += 1;
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}
