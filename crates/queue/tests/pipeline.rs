//! End-to-end pipeline tests over the in-memory stores and queue.
//!
//! Issue a token, publish the job, let a worker send the email, then
//! consume the token from the email that was "sent".

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mailverify_common::{AppError, AppResult};
use mailverify_core::{
    AccountRef, AccountStore, MailSender, MemoryAccountStore, MemoryTokenStore, TokenStore,
    VerificationService,
};
use mailverify_queue::{
    DeliveryJob, JobPublisher, MemoryQueue, QueueBackend, RetryPolicy, ShutdownOutcome,
    VerificationEmailWorker, supervise,
};
use tokio::sync::{Mutex, watch};

/// Records sent emails; fails the first `failures` sends.
#[derive(Default)]
struct TestMailer {
    failures: u32,
    delay: Option<Duration>,
    hang: bool,
    calls: AtomicU32,
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl MailSender for TestMailer {
    async fn send(&self, to: &str, token: &str) -> AppResult<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if call < self.failures {
            return Err(AppError::Mail("451 try again later".to_string()));
        }
        self.sent
            .lock()
            .await
            .push((to.to_string(), token.to_string()));
        Ok(())
    }
}

struct Pipeline {
    service: VerificationService,
    accounts: MemoryAccountStore,
    tokens: MemoryTokenStore,
    queue: MemoryQueue,
}

async fn pipeline() -> Pipeline {
    let accounts = MemoryAccountStore::new();
    accounts.add("alice", "alice@example.com").await;
    let tokens = MemoryTokenStore::new();
    let queue = MemoryQueue::new(Duration::from_millis(10));

    let service = VerificationService::new(
        Arc::new(accounts.clone()),
        Arc::new(tokens.clone()),
        Arc::new(JobPublisher::with_backend(Arc::new(queue.clone()))),
        Duration::from_secs(3600),
    );

    Pipeline {
        service,
        accounts,
        tokens,
        queue,
    }
}

fn worker(queue: &MemoryQueue, mailer: &Arc<TestMailer>) -> VerificationEmailWorker {
    VerificationEmailWorker::new(Arc::new(queue.clone()), mailer.clone())
        .with_error_backoff(Duration::from_millis(10))
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_mail_failure_is_retried_and_account_flips_once() {
    let p = pipeline().await;
    let mailer = Arc::new(TestMailer {
        failures: 1,
        ..Default::default()
    });

    p.service
        .issue_or_resend(AccountRef::Id("alice".to_string()))
        .await
        .expect("issue");
    assert_eq!(p.tokens.count_for_account("alice").await.expect("count"), 1);

    let (tx, rx) = watch::channel(false);
    let w = worker(&p.queue, &mailer);
    let handle = tokio::spawn(async move { w.run(rx).await });

    let queue = p.queue.clone();
    wait_until(|| {
        let queue = queue.clone();
        async move { queue.acked().await == 1 }
    })
    .await;
    tx.send(true).expect("shutdown");
    handle.await.expect("join").expect("worker");

    assert_eq!(mailer.calls.load(Ordering::SeqCst), 2);
    let sent = mailer.sent.lock().await.clone();
    assert_eq!(sent.len(), 1);
    let (to, token) = &sent[0];
    assert_eq!(to, "alice@example.com");

    let confirmation = p.service.consume(token).await.expect("consume");
    assert!(confirmation.newly_verified);
    assert!(matches!(
        p.service.consume(token).await,
        Err(AppError::TokenNotFound)
    ));

    let account = p.accounts.find_by_id("alice").await.expect("find").expect("account");
    assert!(account.email_verified);
    assert_eq!(p.tokens.count_for_account("alice").await.expect("count"), 0);
}

#[tokio::test]
async fn test_message_of_dead_consumer_is_redelivered() {
    let p = pipeline().await;
    p.service
        .issue_or_resend(AccountRef::Id("alice".to_string()))
        .await
        .expect("issue");

    // A consumer takes the message and dies before settling it
    let lost = p.queue.receive().await.expect("receive").expect("message");
    assert_eq!(p.queue.recover_unacked().await, 1);

    let mailer = Arc::new(TestMailer::default());
    let again = p.queue.receive().await.expect("receive").expect("message");
    assert_eq!(again.body, lost.body);

    worker(&p.queue, &mailer).process(again).await.expect("process");
    assert_eq!(mailer.sent.lock().await.len(), 1);
}

#[tokio::test]
async fn test_malformed_jobs_do_not_block_the_queue() {
    let p = pipeline().await;
    p.queue.publish(b"garbage").await.expect("publish");
    p.queue
        .publish(br#"{"to":"x@example.com","token":"t","priority":1}"#)
        .await
        .expect("publish");
    p.service
        .issue_or_resend(AccountRef::Id("alice".to_string()))
        .await
        .expect("issue");

    let mailer = Arc::new(TestMailer::default());
    let (tx, rx) = watch::channel(false);
    let w = worker(&p.queue, &mailer);
    let handle = tokio::spawn(async move { w.run(rx).await });

    let queue = p.queue.clone();
    wait_until(|| {
        let queue = queue.clone();
        async move { queue.acked().await == 1 }
    })
    .await;
    tx.send(true).expect("shutdown");
    handle.await.expect("join").expect("worker");

    assert_eq!(p.queue.discarded().await, 2);
    assert_eq!(p.queue.ready_len().await, 0);
    assert_eq!(mailer.sent.lock().await[0].0, "alice@example.com");
}

#[tokio::test]
async fn test_broker_outage_fails_issue_without_token() {
    let p = pipeline().await;
    p.queue.set_unavailable(true);

    let result = p
        .service
        .issue_or_resend(AccountRef::Id("alice".to_string()))
        .await;

    assert!(matches!(result, Err(AppError::Queue(_))));
    assert_eq!(p.tokens.count_for_account("alice").await.expect("count"), 0);
}

#[tokio::test]
async fn test_permanently_failing_job_is_dead_lettered() {
    let p = pipeline().await;
    p.service
        .issue_or_resend(AccountRef::Id("alice".to_string()))
        .await
        .expect("issue");

    let mailer = Arc::new(TestMailer {
        failures: u32::MAX,
        ..Default::default()
    });
    let w = worker(&p.queue, &mailer).with_retry_policy(RetryPolicy::bounded(3));
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { w.run(rx).await });

    let queue = p.queue.clone();
    wait_until(|| {
        let queue = queue.clone();
        async move { !queue.dead_letters().await.is_empty() }
    })
    .await;
    tx.send(true).expect("shutdown");
    handle.await.expect("join").expect("worker");

    let dead = p.queue.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 3);
    let job = DeliveryJob::decode(&dead[0].body).expect("job");
    assert_eq!(job.to, "alice@example.com");
    assert_eq!(mailer.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_message_finish() {
    let p = pipeline().await;
    p.service
        .issue_or_resend(AccountRef::Id("alice".to_string()))
        .await
        .expect("issue");

    let mailer = Arc::new(TestMailer {
        delay: Some(Duration::from_millis(100)),
        ..Default::default()
    });
    let w = worker(&p.queue, &mailer);
    let (tx, rx) = watch::channel(false);

    let queue = p.queue.clone();
    let signal = async move {
        wait_until(|| {
            let queue = queue.clone();
            async move { queue.in_flight_len().await == 1 }
        })
        .await;
    };

    let outcome = supervise(
        async move { w.run(rx).await },
        signal,
        tx,
        Duration::from_secs(2),
    )
    .await;

    assert!(matches!(outcome, ShutdownOutcome::Graceful));
    assert_eq!(p.queue.acked().await, 1);
    assert_eq!(mailer.sent.lock().await.len(), 1);
}

#[tokio::test]
async fn test_hung_message_is_abandoned_at_grace_deadline() {
    let p = pipeline().await;
    p.service
        .issue_or_resend(AccountRef::Id("alice".to_string()))
        .await
        .expect("issue");

    let mailer = Arc::new(TestMailer {
        hang: true,
        ..Default::default()
    });
    let w = worker(&p.queue, &mailer);
    let (tx, rx) = watch::channel(false);

    let queue = p.queue.clone();
    let signal = async move {
        wait_until(|| {
            let queue = queue.clone();
            async move { queue.in_flight_len().await == 1 }
        })
        .await;
    };

    let outcome = supervise(
        async move { w.run(rx).await },
        signal,
        tx,
        Duration::from_millis(100),
    )
    .await;

    assert!(matches!(outcome, ShutdownOutcome::TimedOut));
    assert_ne!(outcome.exit_code(), 0);

    // Neither acked nor nacked: the broker still owns it
    assert_eq!(p.queue.acked().await, 0);
    assert_eq!(p.queue.ready_len().await, 0);
    assert_eq!(p.queue.in_flight_len().await, 1);
    assert_eq!(p.queue.recover_unacked().await, 1);
}
