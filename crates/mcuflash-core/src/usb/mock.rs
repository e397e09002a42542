//! Scripted transport that records every transfer.

use std::collections::VecDeque;

use super::{ControlRequest, UsbError, UsbTransport};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    ControlIn(ControlRequest),
    ControlOut(ControlRequest, Vec<u8>),
    BulkOut(u8, Vec<u8>),
    BulkIn(u8, usize),
}

#[derive(Default)]
pub struct MockTransport {
    pub events: Vec<Event>,
    control_in: VecDeque<Result<Vec<u8>, UsbError>>,
    control_out: VecDeque<Result<(), UsbError>>,
    bulk_in: VecDeque<Result<Vec<u8>, UsbError>>,
    bulk_out: VecDeque<Result<(), UsbError>>,
    /// Answer to control IN requests once the queue is empty
    default_control_in: Vec<u8>,
}

impl MockTransport {
    pub fn new(default_control_in: Vec<u8>) -> Self {
        Self {
            default_control_in,
            ..Default::default()
        }
    }

    pub fn queue_control_in(&mut self, response: Result<Vec<u8>, UsbError>) -> &mut Self {
        self.control_in.push_back(response);
        self
    }

    pub fn queue_control_out(&mut self, response: Result<(), UsbError>) -> &mut Self {
        self.control_out.push_back(response);
        self
    }

    pub fn queue_bulk_in(&mut self, response: Result<Vec<u8>, UsbError>) -> &mut Self {
        self.bulk_in.push_back(response);
        self
    }

    pub fn queue_bulk_out(&mut self, response: Result<(), UsbError>) -> &mut Self {
        self.bulk_out.push_back(response);
        self
    }

    pub fn control_outs(&self) -> Vec<(ControlRequest, Vec<u8>)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::ControlOut(req, data) => Some((*req, data.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn bulk_outs(&self) -> Vec<(u8, Vec<u8>)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::BulkOut(ep, data) => Some((*ep, data.clone())),
                _ => None,
            })
            .collect()
    }
}

impl UsbTransport for MockTransport {
    fn control_in(&mut self, request: ControlRequest, buf: &mut [u8]) -> Result<usize, UsbError> {
        self.events.push(Event::ControlIn(request));
        let data = match self.control_in.pop_front() {
            Some(response) => response?,
            None => self.default_control_in.clone(),
        };
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn control_out(&mut self, request: ControlRequest, data: &[u8]) -> Result<usize, UsbError> {
        self.events.push(Event::ControlOut(request, data.to_vec()));
        self.control_out.pop_front().unwrap_or(Ok(()))?;
        Ok(data.len())
    }

    fn bulk_out(&mut self, endpoint: u8, data: &[u8]) -> Result<usize, UsbError> {
        self.events.push(Event::BulkOut(endpoint, data.to_vec()));
        self.bulk_out.pop_front().unwrap_or(Ok(()))?;
        Ok(data.len())
    }

    fn bulk_in(&mut self, endpoint: u8, len: usize) -> Result<Vec<u8>, UsbError> {
        self.events.push(Event::BulkIn(endpoint, len));
        match self.bulk_in.pop_front() {
            Some(response) => response,
            None => Ok(vec![0; len]),
        }
    }
}
