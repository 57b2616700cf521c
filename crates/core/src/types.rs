/// Integer node identifier inside a workflow graph.
///
/// The server keys node outputs by the string form of this value.
pub type NodeId = i64;
