use crate::error::ResolveError;

use engine_client::Client;

use log::{debug, info};

/// Resolve every reference in order, stopping at the first failure.
pub async fn resolve_all(client: &Client, references: &[String]) -> Result<Vec<String>, ResolveError> {
    info!("Resolving {} secret reference(s)", references.len());

    let secrets = client.secrets();
    let mut values = Vec::with_capacity(references.len());
    for reference in references {
        debug!("Resolving {reference}");
        values.push(secrets.resolve(reference).await?);
    }

    Ok(values)
}
