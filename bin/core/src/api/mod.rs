use std::sync::Arc;

use axum::{Extension, Router};

use crate::state::State;

mod execute;
mod read;

/// Dependencies handed to every resolver.
pub struct Args {
  pub state: Arc<State>,
}

pub fn router(state: Arc<State>) -> Router {
  Router::new()
    .nest("/read", read::router())
    .nest("/execute", execute::router())
    .layer(Extension(state))
}
