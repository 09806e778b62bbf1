use super::client::BridgeClient;
use super::runner::{ClientError, CommandRunner};
use camino::Utf8Path;

/// Smoke test of the whole chain: report bridge info, open `template` and
/// list its entities. Returns whether the template could be opened.
pub async fn test_integration<R: CommandRunner>(
    client: &mut BridgeClient<R>,
    template: &Utf8Path,
) -> Result<bool, ClientError> {
    let info = client.info().await?;
    tracing::info!("Bridge info: {}", info.trim_end());

    if !template.exists() {
        tracing::error!("EZD template file not found: {}", template);
        return Ok(false);
    }

    if !client.open(template).await? {
        tracing::error!("Failed to open template: {}", template);
        return Ok(false);
    }

    let entities = client.list_entities().await?;
    tracing::info!("Entities in template: {:?}", entities);
    Ok(true)
}

/// Entity names of `template`; empty when it cannot be opened.
pub async fn list_entities_in_template<R: CommandRunner>(
    client: &mut BridgeClient<R>,
    template: &Utf8Path,
) -> Result<Vec<String>, ClientError> {
    if !template.exists() {
        tracing::error!("EZD template file not found: {}", template);
        return Ok(Vec::new());
    }

    if !client.open(template).await? {
        tracing::error!("Failed to open template: {}", template);
        return Ok(Vec::new());
    }

    client.list_entities().await
}
