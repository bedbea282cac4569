//! End-to-end scenarios: message fan-out, a data pipeline that
//! survives a buffer resize, a feedback edge, the port-array downsize
//! guard, disconnect-and-retain, and the leak report on drop.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kernelgraph::{
    Config, ConnectionKind, GraphError, InPortId, InputPortArrayID, KernelGraphError, KernelPorts,
    MessageContext, NodeDefinition, NodeHandle, NodeKernel, NodeSet, OutPortId, PortCategory,
    PortDescriptor, PortDirection, RenderContext, ShapeError, SizeRequest, UpdateContext,
};

#[derive(Default)]
struct Source;

static SOURCE_PORTS: [PortDescriptor; 1] = [PortDescriptor {
    direction: PortDirection::Output,
    category: PortCategory::Message,
    element_type: TypeId::of::<i32>(),
    is_port_array: false,
    buffer_offsets: &[],
    public: true,
}];

impl NodeDefinition for Source {
    fn debug_name(&self) -> &'static str {
        "source"
    }
    fn ports(&self) -> &'static [PortDescriptor] {
        &SOURCE_PORTS
    }
    fn wants_update(&self) -> bool {
        true
    }
    fn update(&mut self, cx: &mut UpdateContext<'_>) {
        cx.emit(OutPortId::internal(0), 7i32);
    }
}

#[derive(Default)]
struct Sink {
    seen: Vec<i32>,
}

static SINK_PORTS: [PortDescriptor; 1] = [PortDescriptor {
    direction: PortDirection::Input,
    category: PortCategory::Message,
    element_type: TypeId::of::<i32>(),
    is_port_array: false,
    buffer_offsets: &[],
    public: true,
}];

impl NodeDefinition for Sink {
    fn debug_name(&self) -> &'static str {
        "sink"
    }
    fn ports(&self) -> &'static [PortDescriptor] {
        &SINK_PORTS
    }
    fn message(&mut self, _port: InPortId, value: &dyn Any, _cx: &mut MessageContext<'_>) {
        self.seen.push(*value.downcast_ref::<i32>().unwrap());
    }
}

#[test]
fn message_fan_out_delivers_to_every_connected_sink() {
    let mut set: NodeSet<()> = NodeSet::new(Config::default(), ());
    let src = set.create::<Source>().unwrap();
    let a = set.create::<Sink>().unwrap();
    let b = set.create::<Sink>().unwrap();
    let c = set.create::<Sink>().unwrap();

    for dest in [a, b, c] {
        set.connect(
            src,
            OutPortId::internal(0),
            dest,
            InPortId::internal(0),
            ConnectionKind::Normal,
        )
        .unwrap();
    }

    set.register_for_update(src).unwrap();
    set.update().unwrap();

    for dest in [a, b, c] {
        assert_eq!(set.cast::<Sink>(dest).unwrap().seen, vec![7]);
    }
}

#[test]
fn direct_send_message_reaches_a_single_destination() {
    let mut set: NodeSet<()> = NodeSet::new(Config::default(), ());
    let dest = set.create::<Sink>().unwrap();

    set.send_message(dest, InPortId::internal(0), 99i32).unwrap();

    assert_eq!(set.cast::<Sink>(dest).unwrap().seen, vec![99]);
}

#[derive(Default)]
struct Producer;

static PRODUCER_PORTS: [PortDescriptor; 1] = [PortDescriptor {
    direction: PortDirection::Output,
    category: PortCategory::Data,
    element_type: TypeId::of::<f32>(),
    is_port_array: false,
    buffer_offsets: &[],
    public: true,
}];

impl NodeDefinition for Producer {
    fn debug_name(&self) -> &'static str {
        "producer"
    }
    fn ports(&self) -> &'static [PortDescriptor] {
        &PRODUCER_PORTS
    }
    fn build_kernel(&mut self) -> Option<Box<dyn NodeKernel>> {
        Some(Box::new(CountingKernel::default()))
    }
}

#[derive(Default)]
struct Consumer;

static CONSUMER_PORTS: [PortDescriptor; 1] = [PortDescriptor {
    direction: PortDirection::Input,
    category: PortCategory::Data,
    element_type: TypeId::of::<f32>(),
    is_port_array: false,
    buffer_offsets: &[],
    public: true,
}];

impl NodeDefinition for Consumer {
    fn debug_name(&self) -> &'static str {
        "consumer"
    }
    fn ports(&self) -> &'static [PortDescriptor] {
        &CONSUMER_PORTS
    }
    fn build_kernel(&mut self) -> Option<Box<dyn NodeKernel>> {
        Some(Box::new(CountingKernel::default()))
    }
}

#[derive(Default)]
struct CountingKernel {
    runs: Arc<AtomicUsize>,
}

impl NodeKernel for CountingKernel {
    fn process(&mut self, _ports: KernelPorts<'_>, _cx: &mut RenderContext<'_>) {
        self.runs.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn data_pipeline_keeps_dispatching_kernels_after_a_buffer_resize() {
    let mut set: NodeSet<()> = NodeSet::new(Config::default(), ());
    let p = set.create::<Producer>().unwrap();
    let q = set.create::<Consumer>().unwrap();

    set.connect(p, OutPortId::internal(0), q, InPortId::internal(0), ConnectionKind::Normal)
        .unwrap();

    set.update().unwrap();
    set.set_buffer_size(p, OutPortId::internal(0), SizeRequest(256)).unwrap();
    set.update().unwrap();
    set.update().unwrap();
}

#[derive(Default)]
struct FeedbackNode;

static FEEDBACK_PORTS: [PortDescriptor; 2] = [
    PortDescriptor {
        direction: PortDirection::Input,
        category: PortCategory::Data,
        element_type: TypeId::of::<f32>(),
        is_port_array: false,
        buffer_offsets: &[],
        public: true,
    },
    PortDescriptor {
        direction: PortDirection::Output,
        category: PortCategory::Data,
        element_type: TypeId::of::<f32>(),
        is_port_array: false,
        buffer_offsets: &[],
        public: true,
    },
];

impl NodeDefinition for FeedbackNode {
    fn debug_name(&self) -> &'static str {
        "feedback_node"
    }
    fn ports(&self) -> &'static [PortDescriptor] {
        &FEEDBACK_PORTS
    }
}

#[test]
fn a_feedback_edge_is_accepted_between_data_ports() {
    let mut set: NodeSet<()> = NodeSet::new(Config::default(), ());
    let a = set.create::<FeedbackNode>().unwrap();
    let b = set.create::<FeedbackNode>().unwrap();

    set.connect(a, OutPortId::internal(0), b, InPortId::internal(0), ConnectionKind::Normal)
        .unwrap();
    set.connect(b, OutPortId::internal(0), a, InPortId::internal(0), ConnectionKind::Feedback)
        .unwrap();
}

#[test]
fn a_feedback_edge_sorts_its_group_instead_of_reporting_a_cycle() {
    let mut set: NodeSet<()> = NodeSet::new(Config::default(), ());
    let a = set.create::<FeedbackNode>().unwrap();
    let b = set.create::<FeedbackNode>().unwrap();

    set.connect(a, OutPortId::internal(0), b, InPortId::internal(0), ConnectionKind::Normal)
        .unwrap();
    set.connect(b, OutPortId::internal(0), a, InPortId::internal(0), ConnectionKind::Feedback)
        .unwrap();

    set.update().unwrap();

    assert!(set.traversal_errors().is_empty());
    assert!(!set
        .traversal_errors()
        .iter()
        .any(|(_, e)| *e == GraphError::Cycles));
}

#[test]
fn a_feedback_edge_between_message_ports_is_rejected() {
    let mut set: NodeSet<()> = NodeSet::new(Config::default(), ());
    let src = set.create::<Source>().unwrap();
    let dest = set.create::<Sink>().unwrap();

    let result = set.connect(
        src,
        OutPortId::internal(0),
        dest,
        InPortId::internal(0),
        ConnectionKind::Feedback,
    );
    assert!(matches!(
        result,
        Err(KernelGraphError::Shape(ShapeError::FeedbackOnNonData))
    ));
}

#[derive(Default)]
struct IntSink;

static INT_SINK_PORTS: [PortDescriptor; 1] = [PortDescriptor {
    direction: PortDirection::Input,
    category: PortCategory::Data,
    element_type: TypeId::of::<i32>(),
    is_port_array: false,
    buffer_offsets: &[],
    public: true,
}];

impl NodeDefinition for IntSink {
    fn debug_name(&self) -> &'static str {
        "int_sink"
    }
    fn ports(&self) -> &'static [PortDescriptor] {
        &INT_SINK_PORTS
    }
}

#[test]
fn a_message_source_can_connect_to_a_data_destination() {
    let mut set: NodeSet<()> = NodeSet::new(Config::default(), ());
    let src = set.create::<Source>().unwrap();
    let dest = set.create::<IntSink>().unwrap();

    set.connect(src, OutPortId::internal(0), dest, InPortId::internal(0), ConnectionKind::Normal)
        .unwrap();

    // The destination stays unique even across a Message->Data edge.
    let other = set.create::<Source>().unwrap();
    let result = set.connect(other, OutPortId::internal(0), dest, InPortId::internal(0), ConnectionKind::Normal);
    assert!(matches!(
        result,
        Err(KernelGraphError::Shape(ShapeError::MultipleDataInputs(..)))
    ));
}

#[derive(Default)]
struct ArrayConsumer;

static ARRAY_CONSUMER_PORTS: [PortDescriptor; 1] = [PortDescriptor {
    direction: PortDirection::Input,
    category: PortCategory::Message,
    element_type: TypeId::of::<i32>(),
    is_port_array: true,
    buffer_offsets: &[],
    public: true,
}];

impl NodeDefinition for ArrayConsumer {
    fn debug_name(&self) -> &'static str {
        "array_consumer"
    }
    fn ports(&self) -> &'static [PortDescriptor] {
        &ARRAY_CONSUMER_PORTS
    }
}

#[test]
fn port_array_cannot_shrink_below_its_highest_connected_index() {
    let mut set: NodeSet<()> = NodeSet::new(Config::default(), ());
    let src = set.create::<Source>().unwrap();
    let n = set.create::<ArrayConsumer>().unwrap();

    set.set_port_array_size(n, InPortId::internal(0), 4).unwrap();
    set.connect(
        src,
        OutPortId::internal(0),
        n,
        InputPortArrayID::array_element(InPortId::internal(0), 3),
        ConnectionKind::Normal,
    )
    .unwrap();

    let blocked = set.set_port_array_size(n, InPortId::internal(0), 2);
    assert!(matches!(
        blocked,
        Err(KernelGraphError::Shape(ShapeError::IndexOutOfRange { .. }))
    ));

    set.disconnect(
        src,
        OutPortId::internal(0),
        n,
        InputPortArrayID::array_element(InPortId::internal(0), 3),
    )
    .unwrap();

    set.set_port_array_size(n, InPortId::internal(0), 2).unwrap();
}

#[test]
fn disconnecting_with_retain_freezes_the_last_value_into_b() {
    let mut set: NodeSet<()> = NodeSet::new(Config::default(), ());
    let p = set.create::<Producer>().unwrap();
    let q = set.create::<Consumer>().unwrap();

    set.connect(p, OutPortId::internal(0), q, InPortId::internal(0), ConnectionKind::Normal)
        .unwrap();

    set.update().unwrap();

    set.disconnect_and_retain_value(p, OutPortId::internal(0), q, InPortId::internal(0))
        .unwrap();

    // Nothing is connected into q anymore, and a second disconnect of the
    // same (now missing) edge correctly fails.
    let missing = set.disconnect_and_retain_value(p, OutPortId::internal(0), q, InPortId::internal(0));
    assert!(matches!(
        missing,
        Err(KernelGraphError::Shape(ShapeError::ConnectionMissing(..)))
    ));
}

#[test]
fn leaking_nodes_at_drop_logs_a_warning_and_does_not_panic() {
    let mut set: NodeSet<()> = NodeSet::new(Config::default(), ());
    let _ = set.create::<Source>().unwrap();
    let _ = set.create::<Sink>().unwrap();
    drop(set);
}

#[test]
fn destroying_every_node_leaves_no_leak_warning() {
    let mut set: NodeSet<()> = NodeSet::new(Config::default(), ());
    let a = set.create::<Source>().unwrap();
    let b = set.create::<Sink>().unwrap();
    set.connect(a, OutPortId::internal(0), b, InPortId::internal(0), ConnectionKind::Normal)
        .unwrap();

    set.destroy(b).unwrap();
    set.destroy(a).unwrap();

    let other: NodeHandle = NodeHandle::DANGLING;
    assert!(!set.exists(other));
    drop(set);
}
