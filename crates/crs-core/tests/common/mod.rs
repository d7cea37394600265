#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use crs_core::{
    AgentError, AgentSink, ConnectedRuntime, InlineVm, Options, TraceId, VmSupport, CLASS_HASH_LEN,
};

/// One notification as the agent saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    ClassLoad {
        name: String,
        hash: Option<[u8; CLASS_HASH_LEN]>,
        class_id: TraceId,
        loader_id: TraceId,
        source: Option<String>,
    },
    FirstCall {
        holder_id: TraceId,
        method_name: String,
    },
    ToJavaCall {
        name: String,
    },
}

/// Agent double that records every notification.
pub struct CollectingSink {
    deliveries: Mutex<Vec<Delivery>>,
    fail_start: bool,
}

impl CollectingSink {
    pub fn new() -> CollectingSink {
        CollectingSink {
            deliveries: Mutex::new(Vec::new()),
            fail_start: false,
        }
    }

    pub fn failing_start() -> CollectingSink {
        CollectingSink {
            deliveries: Mutex::new(Vec::new()),
            fail_start: true,
        }
    }

    /// Takes everything delivered so far.
    pub fn take(&self) -> Vec<Delivery> {
        std::mem::take(&mut self.deliveries.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }
}

impl AgentSink for CollectingSink {
    fn start(&self, _arguments: &str) -> Result<(), AgentError> {
        if self.fail_start {
            Err(AgentError::new("agent class not found"))
        } else {
            Ok(())
        }
    }

    fn notify_class_load(
        &self,
        name: &str,
        hash: Option<&[u8; CLASS_HASH_LEN]>,
        class_id: TraceId,
        loader_id: TraceId,
        source: Option<&str>,
    ) -> Result<(), AgentError> {
        self.deliveries.lock().unwrap().push(Delivery::ClassLoad {
            name: name.to_string(),
            hash: hash.copied(),
            class_id,
            loader_id,
            source: source.map(str::to_string),
        });
        Ok(())
    }

    fn notify_first_call(&self, holder_id: TraceId, method_name: &str) -> Result<(), AgentError> {
        self.deliveries.lock().unwrap().push(Delivery::FirstCall {
            holder_id,
            method_name: method_name.to_string(),
        });
        Ok(())
    }

    fn notify_to_java_call(&self, name: &str) -> Result<(), AgentError> {
        self.deliveries.lock().unwrap().push(Delivery::ToJavaCall {
            name: name.to_string(),
        });
        Ok(())
    }
}

/// An engaged subsystem over a collecting sink and an inline VM.
pub fn engaged_crs(area_size: usize) -> (Arc<CollectingSink>, Arc<InlineVm>, ConnectedRuntime) {
    let sink = Arc::new(CollectingSink::new());
    let vm = Arc::new(InlineVm::new());
    let mut options = Options::default();
    options.use_crs = true;
    options.area_size = area_size;
    let agent: Arc<dyn AgentSink> = sink.clone() as Arc<dyn AgentSink>;
    let vm_dyn: Arc<dyn VmSupport> = vm.clone() as Arc<dyn VmSupport>;
    let crs = ConnectedRuntime::init(options, agent, vm_dyn);
    crs.engage();
    assert!(crs.enabled(), "subsystem must come up");
    (sink, vm, crs)
}
