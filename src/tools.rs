use std::sync::Arc;

use crate::gateway::{QueryGateway, QueryRequest, QueryVerdict};
use crate::model::{CandidateSet, ClientScope};
use crate::retrieval::{RetrievalError, SemanticIndex, retrieve};

/// The two operations a decision loop may call.
pub trait TransactionTools: Send + Sync {
    fn retrieve(&self, query_text: &str) -> Result<CandidateSet, RetrievalError>;

    fn authorize_and_run(&self, scope: ClientScope, query_text: &str) -> QueryVerdict;
}

/// Binds a semantic index and a gateway-guarded store behind [`TransactionTools`].
pub struct ToolBox {
    index: Arc<dyn SemanticIndex>,
    gateway: QueryGateway,
}

impl ToolBox {
    pub fn new(index: Arc<dyn SemanticIndex>, gateway: QueryGateway) -> Self {
        Self { index, gateway }
    }
}

impl TransactionTools for ToolBox {
    fn retrieve(&self, query_text: &str) -> Result<CandidateSet, RetrievalError> {
        retrieve(self.index.as_ref(), query_text)
    }

    fn authorize_and_run(&self, scope: ClientScope, query_text: &str) -> QueryVerdict {
        self.gateway
            .authorize_and_run(&QueryRequest::new(scope, query_text))
    }
}
