//! Multi-node integration tests
//!
//! Every test starts real nodes on ephemeral localhost ports and talks to
//! them over TCP.
//!
//! ## What These Tests Verify
//!
//! - Invitation handshake and full-state transfer
//! - Mutation replication in both directions, ownership and map writes
//! - Delivery reporting for duplicate and unreachable invitees
//! - Join/leave announcements across three peers
//! - Search rumors spreading by gossip and answers reaching the creator

use std::collections::{BTreeMap, HashMap};
use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use grapevine_core::{
    AccountId, AccountService, Address, ClientCallback, Contact, Grapevine, GrapevineConfig,
    GrapevineError, GrapevineResult, MutationOutcome, SearchId, SharedDataId, SharedDataProxy,
    Value,
};
use parking_lot::Mutex;
use tokio::time::{sleep, Duration, Instant};

/// Callback that records everything it sees
#[derive(Default)]
struct Recorder {
    accept_invites: bool,
    answer: Option<String>,
    searches_seen: Mutex<Vec<String>>,
    results: Mutex<Vec<(SearchId, String, Contact)>>,
    available: Mutex<Vec<SharedDataId>>,
    accepted: Mutex<Vec<Contact>>,
}

impl Recorder {
    fn accepting() -> Arc<Self> {
        Arc::new(Self {
            accept_invites: true,
            ..Default::default()
        })
    }

    fn declining() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn answering(text: &str) -> Arc<Self> {
        Arc::new(Self {
            accept_invites: true,
            answer: Some(text.to_string()),
            ..Default::default()
        })
    }
}

impl ClientCallback for Recorder {
    fn on_search(&self, _id: SearchId, query: &str) -> bool {
        self.searches_seen.lock().push(query.to_string());
        self.answer.is_some()
    }

    fn search_response(&self, _id: SearchId, _query: &str) -> String {
        self.answer.clone().unwrap_or_default()
    }

    fn on_search_result(&self, id: SearchId, response: &str, responder: &Contact) {
        self.results
            .lock()
            .push((id, response.to_string(), responder.clone()));
    }

    fn on_invited(&self, _id: SharedDataId, _role: &str, _inviter: &Contact) -> bool {
        self.accept_invites
    }

    fn on_invite_accepted(&self, _shared_data: &SharedDataProxy, invitee: &Contact) {
        self.accepted.lock().push(invitee.clone());
    }

    fn on_shared_data_available(&self, shared_data: &SharedDataProxy) {
        self.available.lock().push(shared_data.id());
    }
}

async fn start_node(callback: Arc<Recorder>) -> Grapevine {
    let node = Grapevine::new(GrapevineConfig::ephemeral(), callback);
    node.start().await.unwrap();
    node
}

/// Poll `condition` until it holds or `timeout` passes
async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// An address nothing is listening on
fn dead_address() -> Address {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Address::from(addr)
}

/// Serve a game on `host` as p1 with a score and a move list
fn serve_game(host: &Grapevine) -> SharedDataProxy {
    let mut game = host.new_shared_data();
    game.set_me("p1").unwrap();
    game.create("score", 0, "p1", "public");
    game.create_array("moves", vec![], "p1", "public");
    host.serve(game).unwrap()
}

#[tokio::test]
async fn test_invite_transfers_full_state() {
    let a_cb = Recorder::accepting();
    let b_cb = Recorder::accepting();
    let a = start_node(a_cb.clone()).await;
    let b = start_node(b_cb.clone()).await;

    let game = serve_game(&a);
    assert!(a.invite(&game, &b.me(), "p2").await.unwrap());

    assert_eq!(*b_cb.available.lock(), vec![game.id()]);
    assert_eq!(*a_cb.accepted.lock(), vec![b.me()]);

    let replica = b.shared_data(&game.id()).expect("replica served on B");
    assert_eq!(replica.me().as_deref(), Some("p2"));
    assert_eq!(replica.get("score"), Value::Int(0));
    assert_eq!(replica.get_owner("score").as_deref(), Some("p1"));
    assert_eq!(replica.creator(), &a.me());

    let roles: Vec<String> = replica.invitees().into_keys().collect();
    assert_eq!(roles, vec!["p1".to_string(), "p2".to_string()]);

    // Accepting an invite makes the two nodes mongers of each other
    assert!(a.mongers().contains(&b.address()));
    assert!(b.mongers().contains(&a.address()));
}

#[tokio::test]
async fn test_mutations_replicate_both_ways() {
    let a = start_node(Recorder::accepting()).await;
    let b = start_node(Recorder::accepting()).await;

    let game = serve_game(&a);
    assert!(a.invite(&game, &b.me(), "p2").await.unwrap());
    let replica = b.shared_data(&game.id()).unwrap();

    let report = game.set("score", 5).await.unwrap();
    assert_eq!(report.outcome, MutationOutcome::Applied);
    assert_eq!(report.delivery.delivered, vec!["p2".to_string()]);
    assert!(report.delivery.is_complete());
    assert_eq!(replica.get("score"), Value::Int(5));

    let report = replica.append("moves", "e4").await.unwrap();
    assert_eq!(report.delivery.delivered, vec!["p1".to_string()]);
    assert_eq!(game.get("moves"), Value::List(vec![Value::from("e4")]));

    replica.append("moves", "e5").await.unwrap();
    assert_eq!(
        game.get("moves"),
        Value::List(vec![Value::from("e4"), Value::from("e5")])
    );
}

#[tokio::test]
async fn test_write_during_invite_converges() {
    let a = start_node(Recorder::accepting()).await;
    let b = start_node(Recorder::accepting()).await;
    let game = serve_game(&a);

    let b_me = b.me();
    let (invited, report) = tokio::join!(a.invite(&game, &b_me, "p2"), async {
        while !game.invitees().contains_key("p2") {
            tokio::task::yield_now().await;
        }
        game.set("score", 9).await
    });
    assert!(invited.unwrap());
    let report = report.unwrap();
    assert_eq!(report.delivery.delivered, vec!["p2".to_string()]);
    assert!(report.delivery.is_complete());

    let replica = b.shared_data(&game.id()).unwrap();
    assert_eq!(game.get("score"), Value::Int(9));
    assert_eq!(replica.get("score"), Value::Int(9));
}

#[tokio::test]
async fn test_owner_change_and_map_writes_replicate() {
    let a = start_node(Recorder::accepting()).await;
    let b = start_node(Recorder::accepting()).await;

    let game = serve_game(&a);
    game.create_map("board", BTreeMap::new(), "p1", "public")
        .await
        .unwrap();
    assert!(a.invite(&game, &b.me(), "p2").await.unwrap());
    let replica = b.shared_data(&game.id()).unwrap();

    game.change_data_owner("score", "p2").await.unwrap();
    assert_eq!(game.get_owner("score").as_deref(), Some("p2"));
    assert_eq!(replica.get_owner("score").as_deref(), Some("p2"));

    replica.set_map("board", "a1", "rook").await.unwrap();
    let board = game.get("board");
    assert_eq!(board.as_map().unwrap().get("a1"), Some(&Value::from("rook")));
}

#[tokio::test]
async fn test_missing_key_is_not_sent() {
    let a = start_node(Recorder::accepting()).await;
    let b = start_node(Recorder::accepting()).await;

    let game = serve_game(&a);
    assert!(a.invite(&game, &b.me(), "p2").await.unwrap());

    let report = game.set("nope", 1).await.unwrap();
    assert_eq!(report.outcome, MutationOutcome::KeyNotFound);
    assert!(report.delivery.delivered.is_empty());
    assert!(b.shared_data(&game.id()).unwrap().get("nope").is_null());
}

#[tokio::test]
async fn test_shape_mismatch_is_an_error() {
    let a = start_node(Recorder::accepting()).await;
    let game = serve_game(&a);

    let err = game.append("score", 1).await.unwrap_err();
    assert!(matches!(err, GrapevineError::ShapeMismatch { .. }));
    assert_eq!(game.get("score"), Value::Int(0));
}

#[tokio::test]
async fn test_double_invite_delivers_once() {
    let a = start_node(Recorder::accepting()).await;
    let b_cb = Recorder::accepting();
    let b = start_node(b_cb.clone()).await;

    let game = serve_game(&a);
    assert!(a.invite(&game, &b.me(), "p2").await.unwrap());
    assert!(a.invite(&game, &b.me(), "p2").await.unwrap());
    assert_eq!(b_cb.available.lock().len(), 1);

    let replica = b.shared_data(&game.id()).unwrap();
    let changes = Arc::new(AtomicUsize::new(0));
    let counter = changes.clone();
    replica.on_data_change(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let report = game.set("score", 7).await.unwrap();
    assert_eq!(report.delivery.delivered, vec!["p2".to_string()]);
    assert_eq!(changes.load(Ordering::SeqCst), 1);
    assert_eq!(replica.get("score"), Value::Int(7));
}

#[tokio::test]
async fn test_unreachable_invitee_keeps_local_change() {
    let a = start_node(Recorder::accepting()).await;
    let b = start_node(Recorder::accepting()).await;

    let game = serve_game(&a);
    assert!(a.invite(&game, &b.me(), "p2").await.unwrap());
    game.add_invitee(Contact::new(AccountId::new("ghost"), dead_address()), "p3");

    let report = game.set("score", 3).await.unwrap();
    assert_eq!(report.outcome, MutationOutcome::Applied);
    assert_eq!(report.delivery.delivered, vec!["p2".to_string()]);
    assert_eq!(report.delivery.failed, vec!["p3".to_string()]);
    assert!(!report.delivery.is_complete());

    assert_eq!(game.get("score"), Value::Int(3));
    assert_eq!(b.shared_data(&game.id()).unwrap().get("score"), Value::Int(3));
}

#[tokio::test]
async fn test_invite_to_unreachable_peer_fails() {
    let a = start_node(Recorder::accepting()).await;
    let game = serve_game(&a);

    let ghost = Contact::new(AccountId::new("ghost"), dead_address());
    let result = a.invite(&game, &ghost, "p2").await;
    assert!(result.is_err());
    assert!(!game.invitees().contains_key("p2"));
}

#[tokio::test]
async fn test_declined_invite() {
    let a = start_node(Recorder::accepting()).await;
    let c_cb = Recorder::declining();
    let c = start_node(c_cb.clone()).await;

    let game = serve_game(&a);
    assert!(!a.invite(&game, &c.me(), "p2").await.unwrap());

    assert!(c.shared_data(&game.id()).is_none());
    assert!(c_cb.available.lock().is_empty());
    assert!(!game.invitees().contains_key("p2"));
}

#[tokio::test]
async fn test_three_peer_join_and_leave() {
    let a = start_node(Recorder::accepting()).await;
    let b = start_node(Recorder::accepting()).await;
    let c = start_node(Recorder::accepting()).await;

    let game = serve_game(&a);
    assert!(a.invite(&game, &b.me(), "p2").await.unwrap());
    assert!(a.invite(&game, &c.me(), "p3").await.unwrap());

    let on_b = b.shared_data(&game.id()).unwrap();
    let on_c = c.shared_data(&game.id()).unwrap();

    // B heard about p3 through the join announcement
    assert_eq!(on_b.invitees().get("p3"), Some(&c.me()));

    let report = on_b.set("score", 11).await.unwrap();
    let mut delivered = report.delivery.delivered.clone();
    delivered.sort();
    assert_eq!(delivered, vec!["p1".to_string(), "p3".to_string()]);
    assert_eq!(game.get("score"), Value::Int(11));
    assert_eq!(on_c.get("score"), Value::Int(11));

    let delivery = c.leave_share(&on_c).await.unwrap();
    assert!(delivery.is_complete());
    assert!(c.shared_data(&game.id()).is_none());
    assert!(!game.invitees().contains_key("p3"));
    assert!(!on_b.invitees().contains_key("p3"));

    let report = on_b.set("score", 12).await.unwrap();
    assert_eq!(report.delivery.delivered, vec!["p1".to_string()]);
    assert_eq!(on_c.get("score"), Value::Int(11));
}

#[tokio::test]
async fn test_join_share_announces_role() {
    let a = start_node(Recorder::accepting()).await;
    let b = start_node(Recorder::accepting()).await;

    let game = serve_game(&a);
    assert!(a.invite(&game, &b.me(), "p2").await.unwrap());
    let on_b = b.shared_data(&game.id()).unwrap();
    game.remove_invitee("p2");

    let delivery = b.join_share(&on_b).await.unwrap();
    assert_eq!(delivery.delivered, vec!["p1".to_string()]);
    assert_eq!(game.invitees().get("p2"), Some(&b.me()));
}

#[tokio::test]
async fn test_search_spreads_and_is_answered() {
    let a_cb = Recorder::accepting();
    let b_cb = Recorder::answering("I play chess");
    let a = start_node(a_cb.clone()).await;
    let b = start_node(b_cb.clone()).await;

    a.add_server(b.address());
    let search = a.search("chess partner");

    let answered = wait_for(Duration::from_secs(5), || !a_cb.results.lock().is_empty()).await;
    assert!(answered, "search result should reach the creator");

    let results = a_cb.results.lock().clone();
    let (id, response, responder) = &results[0];
    assert_eq!(*id, search);
    assert_eq!(response, "I play chess");
    assert_eq!(responder, &b.me());

    // The gossiping sender becomes a monger of the receiver
    assert!(b.mongers().contains(&a.address()));
    assert!(wait_for(Duration::from_secs(5), || b.gossip().rumors().len() == 1).await);

    // The creator never offers its own search to itself
    assert!(a_cb.searches_seen.lock().is_empty());
}

#[tokio::test]
async fn test_search_relays_through_middle_peer() {
    let a_cb = Recorder::accepting();
    let a = start_node(a_cb.clone()).await;
    let b = start_node(Recorder::accepting()).await;
    let c_cb = Recorder::answering("here");
    let c = start_node(c_cb.clone()).await;

    // A only knows B, B only knows C
    a.add_server(b.address());
    b.add_server(c.address());
    let search = a.search("anyone");

    let answered = wait_for(Duration::from_secs(10), || {
        a_cb.results
            .lock()
            .iter()
            .any(|(id, _, responder)| *id == search && responder == &c.me())
    })
    .await;
    assert!(answered, "C should answer A's search relayed by B");
    assert_eq!(*c_cb.searches_seen.lock(), vec!["anyone".to_string()]);
}

#[tokio::test]
async fn test_seeds_from_config_become_mongers() {
    let b = start_node(Recorder::accepting()).await;

    let mut config = GrapevineConfig::ephemeral();
    config.seeds = vec![b.address().to_string()];
    let a = Grapevine::new(config, Recorder::accepting());
    a.start().await.unwrap();

    assert_eq!(a.mongers(), vec![b.address()]);
    assert!(wait_for(Duration::from_secs(5), || b.mongers().contains(&a.address())).await);
}

#[tokio::test]
async fn test_start_twice_fails() {
    let a = start_node(Recorder::accepting()).await;
    let err = a.start().await.unwrap_err();
    assert!(matches!(err, GrapevineError::AlreadyStarted(_)));
}

/// In-memory account service
#[derive(Default)]
struct MemoryAccounts {
    accounts: Mutex<HashMap<String, (String, Option<Address>)>>,
}

impl AccountService for MemoryAccounts {
    async fn create_account(&self, username: &str, password: &str) -> GrapevineResult<AccountId> {
        let mut accounts = self.accounts.lock();
        if accounts.contains_key(username) {
            return Err(GrapevineError::Account(format!("{username} exists")));
        }
        accounts.insert(username.to_string(), (password.to_string(), None));
        Ok(AccountId::new(username))
    }

    async fn authenticate(
        &self,
        username: &str,
        password: &str,
        address: Address,
    ) -> GrapevineResult<AccountId> {
        let mut accounts = self.accounts.lock();
        match accounts.get_mut(username) {
            Some((stored, location)) if stored == password => {
                *location = Some(address);
                Ok(AccountId::new(username))
            }
            _ => Err(GrapevineError::Account("bad credentials".to_string())),
        }
    }
}

#[tokio::test]
async fn test_login_sets_local_identity() {
    let accounts = MemoryAccounts::default();
    let a = start_node(Recorder::accepting()).await;
    assert!(a.me().account_id.is_nil());

    a.create_account(&accounts, "alice", "pw").await.unwrap();
    assert!(a.login(&accounts, "alice", "wrong").await.is_err());
    assert!(a.me().account_id.is_nil());

    let id = a.login(&accounts, "alice", "pw").await.unwrap();
    assert_eq!(id, AccountId::new("alice"));
    assert_eq!(a.me().account_id, id);
    assert_eq!(
        accounts.accounts.lock().get("alice").unwrap().1,
        Some(a.address())
    );
}
