pub use self::{
    dune_response::{
        ExecuteResponse, ExecutionResults, ExecutionState, ResultSet, Row,
    },
    rpc_response::{Log, RpcBody, RpcErrorObject},
};

mod dune_response;
mod rpc_response;
