mod common;

use adsync::engine::{EngineSettings, SyncEngine};
use adsync::model::{Action, JobStatus, Operand};
use adsync::platform::microsoft::{MicrosoftAdapter, MicrosoftTransport, UploadStatus, UploadUrl};
use anyhow::Result;
use async_trait::async_trait;
use common::*;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const HEADER: &str = "Type,Status,Id,Parent Id,Client Id,Name,Keyword,Match Type,Bid,Title,Text,Final Url,Error,Error Number";

/// Bulk service double. The last scripted status repeats.
#[derive(Clone, Default)]
struct FakeBulkService {
    uploads: Arc<Mutex<Vec<(String, String)>>>,
    statuses: Arc<Mutex<VecDeque<UploadStatus>>>,
    result_file: Arc<Mutex<String>>,
    status_calls: Arc<Mutex<u32>>,
}

#[async_trait]
impl MicrosoftTransport for FakeBulkService {
    async fn get_bulk_upload_url(&self, _account_id: &str) -> Result<UploadUrl> {
        Ok(UploadUrl {
            request_id: "req-1".into(),
            upload_url: "https://bulk.example/upload/req-1".into(),
        })
    }

    async fn upload_file(&self, _upload_url: &str, account_id: &str, body: Vec<u8>) -> Result<()> {
        self.uploads
            .lock()
            .await
            .push((account_id.to_string(), String::from_utf8(body)?));
        Ok(())
    }

    async fn get_bulk_upload_status(
        &self,
        _account_id: &str,
        _request_id: &str,
    ) -> Result<UploadStatus> {
        *self.status_calls.lock().await += 1;
        let mut statuses = self.statuses.lock().await;
        let status = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().cloned()
        };
        Ok(status.unwrap_or(UploadStatus {
            request_status: "InProgress".into(),
            percent_complete: None,
            result_file_url: None,
        }))
    }

    async fn download_result_file(&self, _url: &str) -> Result<String> {
        Ok(self.result_file.lock().await.clone())
    }
}

fn status(raw: &str, url: Option<&str>) -> UploadStatus {
    UploadStatus {
        request_status: raw.into(),
        percent_complete: None,
        result_file_url: url.map(str::to_string),
    }
}

fn result_row(row_type: &str, id: &str, client_id: &str, error: &str, number: &str) -> String {
    format!("{row_type},,{id},,{client_id},,,,,,,,{error},{number}")
}

fn engine_for(
    store: &Arc<adsync::db::SqliteStore>,
    service: &FakeBulkService,
    notifier: &RecordingNotifier,
) -> SyncEngine<MicrosoftAdapter<FakeBulkService>> {
    let adapter = MicrosoftAdapter::new(service.clone()).with_min_request_interval(Duration::ZERO);
    SyncEngine::new(
        ns(),
        Arc::new(adapter),
        store.clone(),
        store.clone(),
        Arc::new(notifier.clone()),
    )
    .with_settings(EngineSettings {
        submit_delay: Duration::ZERO,
        ..EngineSettings::default()
    })
}

#[tokio::test]
async fn bulk_add_round_trip() {
    let store = setup_store().await;
    seed_default(&store).await;
    for id in [1, 2] {
        store.enqueue(&ns(), &ad_group(id, Action::Add)).await.unwrap();
    }
    let service = FakeBulkService::default();
    let notifier = RecordingNotifier::default();
    let engine = engine_for(&store, &service, &notifier);

    engine.schedule_adds(Operand::AdGroup).await.unwrap();

    let uploads = service.uploads.lock().await.clone();
    assert_eq!(uploads.len(), 1);
    let (account, body) = &uploads[0];
    assert_eq!(account, "A-1");
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], HEADER);
    assert!(lines[1].starts_with("Format Version,"));
    assert!(lines[2].starts_with("Ad Group,Active,,C-10,1,Group 1,"));
    assert!(lines[3].starts_with("Ad Group,Active,,C-10,2,Group 2,"));

    let job = all_jobs(&store).await.remove(0);
    assert_eq!(job.job_token, "req-1");
    assert_eq!(job.status, JobStatus::PendingResult);

    service
        .statuses
        .lock()
        .await
        .extend([status("InProgress", None), status("Completed", Some("https://bulk.example/result"))]);
    *service.result_file.lock().await = [
        HEADER.to_string(),
        "Format Version,,,,,6.0,,,,,,,,".to_string(),
        result_row("Account", "A-1", "", "", ""),
        result_row("Ad Group", "111", "1", "", ""),
        result_row("Ad Group", "", "2", "Campaign is not valid", "1217"),
    ]
    .join("\n");

    make_due(&store).await;
    engine.check_batch_job_result().await.unwrap();
    let job = store.job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::PendingResult);
    assert_eq!(job.platform_status.as_deref(), Some("InProgress"));

    make_due(&store).await;
    engine.check_batch_job_result().await.unwrap();
    let job = store.job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.platform_status.as_deref(), Some("Completed"));
    // The result file URL comes from the completing status check.
    assert_eq!(*service.status_calls.lock().await, 2);

    let synced = store
        .synced_entity(&ns(), Operand::AdGroup, 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(synced.remote_id, "111");
    assert!(store.pending_entity(&ns(), Operand::AdGroup, 2).await.unwrap().is_none());
    assert!(store.synced_entity(&ns(), Operand::AdGroup, 2).await.unwrap().is_none());
    assert!(store.error_records(&ns()).await.unwrap().is_empty());
    assert!(notifier.messages().await.is_empty());
}

#[tokio::test]
async fn transient_update_errors_are_recorded() {
    let store = setup_store().await;
    seed_default(&store).await;
    for (id, remote) in [(5, "555"), (6, "666")] {
        let entity = ad_group(id, Action::Update);
        store.insert_synced(&ns(), &synced(&entity, remote)).await.unwrap();
        store.enqueue(&ns(), &entity).await.unwrap();
    }
    let service = FakeBulkService::default();
    let notifier = RecordingNotifier::default();
    let engine = engine_for(&store, &service, &notifier);

    engine.schedule_updates(Operand::AdGroup).await.unwrap();
    let body = service.uploads.lock().await[0].1.clone();
    assert!(body.contains(",555,"));
    assert!(body.contains(",666,"));

    service
        .statuses
        .lock()
        .await
        .push_back(status("CompletedWithErrors", Some("https://bulk.example/result")));
    *service.result_file.lock().await = [
        HEADER.to_string(),
        "Format Version,,,,,6.0,,,,,,,,".to_string(),
        result_row("Ad Group", "555", "5", "", ""),
        result_row("Ad Group", "666", "6", "The service is busy", "0"),
    ]
    .join("\n");

    make_due(&store).await;
    engine.check_batch_job_result().await.unwrap();

    assert_eq!(all_jobs(&store).await[0].status, JobStatus::Complete);
    assert_eq!(*service.status_calls.lock().await, 1);
    assert!(store.pending_entity(&ns(), Operand::AdGroup, 5).await.unwrap().is_none());
    let retry = store
        .pending_entity(&ns(), Operand::AdGroup, 6)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retry.action, Action::Update);

    let errors = store.error_records(&ns()).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].entity_id, 6);
    assert_eq!(errors[0].code, Some(0));
    assert_eq!(errors[0].raw_message, "The service is busy");
}
