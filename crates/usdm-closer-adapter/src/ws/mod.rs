/*
[INPUT]:  WebSocket submodules (streams, frame types)
[OUTPUT]: Organized WebSocket API exports
[POS]:    WebSocket layer - module organization
[UPDATE]: When adding new stream clients
*/

pub mod market;
pub mod message;
pub mod user_data;
