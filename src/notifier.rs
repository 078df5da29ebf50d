use crate::job::ProjectJobResult;

/// Header carrying the correlation id of the operation that created
/// the build job.
pub const OPERATION_ID_HEADER: &str = "X-Operation-Id";

/// Delivers completed job results to the caller-supplied callback URL.
///
/// Delivery is fire-and-forget from the pipeline's perspective: a
/// failed POST is logged, never retried here, and never rolls back the
/// already-recorded result.
pub struct ResultNotifier {
    client: reqwest::Client,
}

impl ResultNotifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub async fn notify(
        &self,
        callback_host: &str,
        callback_path: &str,
        operation_id: &str,
        result: &ProjectJobResult,
    ) {
        let url = format!("{callback_host}{callback_path}");

        let response = self
            .client
            .post(&url)
            .header(OPERATION_ID_HEADER, operation_id)
            .json(result)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                log::debug!("Delivered job result to {url} (operation {operation_id})");
            }
            Ok(response) => {
                log::error!(
                    "Callback {url} answered {} for operation {operation_id}",
                    response.status()
                );
            }
            Err(e) => {
                log::error!("Failed to deliver job result to {url}: {e}");
            }
        }
    }
}

impl Default for ResultNotifier {
    fn default() -> Self {
        Self::new()
    }
}
