//! Integration tests for the Trellis storage drivers
//!
//! These exercise the end-to-end store/fetch/destroy/bump pipeline and the
//! blob write/finalize/read lifecycle against the embedded back-end.

use trellis_crypto::{hash_bytes, KeyPair};
use trellis_node::schema::DESTROY_CONTENT_TYPE;
use trellis_node::{config_bits, DataNode, LicenseNode, Node};
use trellis_storage::{
    blob::derive_data_id, BlobStorage, DbClient, RootQuery, Storage, StorageSettings,
    StorageError, BLOB_FRAGMENT_SIZE,
};

const PARENT: [u8; 32] = [0x0B; 32];
const CREATED: u64 = 1_000_000;
const EXPIRES: u64 = 10_000_000;
const NOW: u64 = 2_000_000;

async fn storage() -> Storage {
    let db = DbClient::connect_sqlite("sqlite::memory:").await.unwrap();
    let mut storage = Storage::new(db, StorageSettings::default());
    storage.create_tables().await.unwrap();
    storage
}

async fn blob_storage() -> BlobStorage {
    let db = DbClient::connect_sqlite("sqlite::memory:").await.unwrap();
    let mut storage = BlobStorage::new(db, StorageSettings::default());
    storage.create_tables().await.unwrap();
    storage
}

fn data_node(keypair: &KeyPair, payload: &[u8]) -> Node {
    data_node_under(keypair, &PARENT, payload)
}

fn data_node_under(keypair: &KeyPair, parent: &[u8; 32], payload: &[u8]) -> Node {
    let mut node = DataNode::new().unwrap();
    node.base_mut().set_parent_id(parent).unwrap();
    node.base_mut().set_owner(&keypair.public_key()).unwrap();
    node.base_mut().set_creation_time(CREATED).unwrap();
    node.base_mut().set_expire_time(EXPIRES).unwrap();
    node.set_content_type("app/message").unwrap();
    node.set_data(payload).unwrap();
    node.base_mut().sign(keypair).unwrap();
    Node::Data(node)
}

fn public_node(keypair: &KeyPair, payload: &[u8]) -> Node {
    let mut node = DataNode::new().unwrap();
    node.base_mut().set_parent_id(&PARENT).unwrap();
    node.base_mut().set_owner(&keypair.public_key()).unwrap();
    node.base_mut().set_creation_time(CREATED).unwrap();
    node.base_mut()
        .set_config_bit(config_bits::IS_PUBLIC, true)
        .unwrap();
    node.set_data(payload).unwrap();
    node.base_mut().sign(keypair).unwrap();
    Node::Data(node)
}

fn license_for(
    issuer: &KeyPair,
    target: &KeyPair,
    node_id1: &[u8; 32],
    creation: u64,
) -> Node {
    let mut license = LicenseNode::new().unwrap();
    license.base_mut().set_parent_id(&PARENT).unwrap();
    license.base_mut().set_owner(&issuer.public_key()).unwrap();
    license.base_mut().set_creation_time(creation).unwrap();
    license.base_mut().set_expire_time(EXPIRES).unwrap();
    license
        .set_target_public_key(&target.public_key())
        .unwrap();
    license.set_node_id1(node_id1).unwrap();
    license.base_mut().sign(issuer).unwrap();
    Node::License(license)
}

mod store_tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_get_roundtrip() {
        let mut storage = storage().await;
        let keypair = KeyPair::generate();
        let node = data_node(&keypair, b"payload");
        let id1 = node.base().id1().unwrap();

        let (inserted, parents) = storage.store(&[node.clone()], NOW, false).await.unwrap();
        assert_eq!(inserted, vec![id1]);
        assert_eq!(parents, vec![PARENT]);

        let loaded = storage.get_node_by_id1(&id1, NOW).await.unwrap().unwrap();
        assert_eq!(loaded.base().id1(), Some(id1));
        assert!(loaded.base().verify());

        // A second store of the same image is skipped entirely.
        let (inserted, parents) = storage.store(&[node], NOW, false).await.unwrap();
        assert!(inserted.is_empty());
        assert!(parents.is_empty());
    }

    #[tokio::test]
    async fn test_store_is_atomic_on_invalid_node() {
        let mut storage = storage().await;
        let keypair = KeyPair::generate();
        let good = data_node(&keypair, b"good");

        // An expired node invalidates the whole batch.
        let mut expired = DataNode::new().unwrap();
        expired.base_mut().set_parent_id(&PARENT).unwrap();
        expired
            .base_mut()
            .set_owner(&keypair.public_key())
            .unwrap();
        expired.base_mut().set_creation_time(1_000).unwrap();
        expired.base_mut().set_expire_time(2_000).unwrap();
        expired.base_mut().sign(&keypair).unwrap();

        let result = storage
            .store(&[good, Node::Data(expired)], NOW, false)
            .await;
        assert!(result.is_err());
        assert_eq!(storage.node_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_nodes_preserves_request_order() {
        let mut storage = storage().await;
        let keypair = KeyPair::generate();
        let a = data_node(&keypair, b"a");
        let b = data_node(&keypair, b"b");
        let id_a = a.base().id1().unwrap();
        let id_b = b.base().id1().unwrap();

        storage.store(&[a, b], NOW, false).await.unwrap();

        let missing = [0xEE; 32];
        let nodes = storage
            .get_nodes_by_id1(&[id_b, missing, id_a], NOW)
            .await
            .unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].as_ref().unwrap().base().id1(), Some(id_b));
        assert!(nodes[1].is_none());
        assert_eq!(nodes[2].as_ref().unwrap().base().id1(), Some(id_a));
    }

    #[tokio::test]
    async fn test_unique_conflict_keeps_earliest() {
        let mut storage = storage().await;
        let issuer = KeyPair::generate();
        let target = KeyPair::generate();
        let node_id1 = [0x1D; 32];

        // Two licenses differing only in creationTime share a sharedHash.
        let l0 = license_for(&issuer, &target, &node_id1, CREATED);
        let l1 = license_for(&issuer, &target, &node_id1, CREATED + 50);
        assert_eq!(l0.base().shared_hash(), l1.base().shared_hash());
        let id_l0 = l0.base().id1().unwrap();

        let (inserted, parents) = storage
            .store(&[l0, l1.clone()], NOW, false)
            .await
            .unwrap();
        assert_eq!(inserted, vec![id_l0]);
        assert_eq!(parents, vec![PARENT]);

        // Re-offering the loser leaves the table unchanged.
        let (inserted, parents) = storage.store(&[l1], NOW, false).await.unwrap();
        assert!(inserted.is_empty());
        assert!(parents.is_empty());
        assert_eq!(storage.node_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_nodes_removes_aux_rows() {
        let mut storage = storage().await;
        let keypair = KeyPair::generate();
        let node = data_node(&keypair, b"payload");
        let id1 = node.base().id1().unwrap();

        storage.store(&[node], NOW, false).await.unwrap();
        storage.delete_nodes(&[id1]).await.unwrap();

        assert_eq!(storage.node_count().await.unwrap(), 0);
        assert!(storage.get_node_by_id1(&id1, NOW).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_preserve_transient_updates_in_place() {
        let mut storage = storage().await;
        let keypair = KeyPair::generate();

        let mut node = DataNode::new().unwrap();
        node.base_mut().set_parent_id(&PARENT).unwrap();
        node.base_mut().set_owner(&keypair.public_key()).unwrap();
        node.base_mut().set_creation_time(CREATED).unwrap();
        node.base_mut().sign(&keypair).unwrap();
        let id1 = node.base().id1().unwrap();

        storage
            .store(&[Node::Data(node.clone())], NOW, true)
            .await
            .unwrap();

        // Flip a transient bit; the image differs only in transient state.
        node.base_mut()
            .set_transient_bit(trellis_node::transient_bits::DYNAMIC_SELF_ACTIVE, true)
            .unwrap();
        let (inserted, _) = storage
            .store(&[Node::Data(node.clone())], NOW + 10, true)
            .await
            .unwrap();
        assert_eq!(inserted, vec![id1]);

        let loaded = storage
            .get_node_by_id1(&id1, NOW + 20)
            .await
            .unwrap()
            .unwrap();
        assert!(loaded
            .base()
            .transient_bit(trellis_node::transient_bits::DYNAMIC_SELF_ACTIVE));

        // Without preserve_transient the same image is a plain duplicate.
        let (inserted, _) = storage
            .store(&[Node::Data(node)], NOW + 20, false)
            .await
            .unwrap();
        assert!(inserted.is_empty());
    }
}

mod destruction_tests {
    use super::*;

    fn destroyer(keypair: &KeyPair, target_id1: &[u8; 32]) -> Node {
        let mut node = DataNode::new().unwrap();
        node.base_mut().set_parent_id(&PARENT).unwrap();
        node.base_mut().set_owner(&keypair.public_key()).unwrap();
        node.base_mut().set_creation_time(CREATED + 100).unwrap();
        node.set_content_type(DESTROY_CONTENT_TYPE).unwrap();
        node.base_mut().set_ref_id(target_id1).unwrap();
        node.base_mut().sign(keypair).unwrap();
        Node::Data(node)
    }

    #[tokio::test]
    async fn test_destroyer_hides_target() {
        let mut storage = storage().await;
        let keypair = KeyPair::generate();
        let pk = keypair.public_key();

        let node = data_node(&keypair, b"target");
        let id1 = node.base().id1().unwrap();
        storage.store(&[node], NOW, false).await.unwrap();
        assert!(storage
            .fetch_single_node(&id1, NOW, &pk, &pk)
            .await
            .unwrap()
            .is_some());

        storage
            .store(&[destroyer(&keypair, &id1)], NOW + 10, false)
            .await
            .unwrap();
        assert!(storage
            .fetch_single_node(&id1, NOW + 20, &pk, &pk)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_indestructible_survives() {
        let mut storage = storage().await;
        let keypair = KeyPair::generate();
        let pk = keypair.public_key();

        let mut node = DataNode::new().unwrap();
        node.base_mut().set_parent_id(&PARENT).unwrap();
        node.base_mut().set_owner(&pk).unwrap();
        node.base_mut().set_creation_time(CREATED).unwrap();
        node.base_mut()
            .set_config_bit(config_bits::IS_INDESTRUCTIBLE, true)
            .unwrap();
        node.base_mut().sign(&keypair).unwrap();
        let id1 = node.base().id1().unwrap();

        storage.store(&[Node::Data(node)], NOW, false).await.unwrap();
        storage
            .store(&[destroyer(&keypair, &id1)], NOW + 10, false)
            .await
            .unwrap();

        assert!(storage
            .fetch_single_node(&id1, NOW + 20, &pk, &pk)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_destroyed_candidate_is_filtered_at_store() {
        let mut storage = storage().await;
        let keypair = KeyPair::generate();

        let node = data_node(&keypair, b"late arrival");
        let id1 = node.base().id1().unwrap();

        // The destroyer arrives before the node does.
        storage
            .store(&[destroyer(&keypair, &id1)], NOW, false)
            .await
            .unwrap();
        let (inserted, _) = storage.store(&[node], NOW + 10, false).await.unwrap();
        assert!(inserted.is_empty());
        assert!(storage
            .get_node_by_id1(&id1, NOW + 20)
            .await
            .unwrap()
            .is_none());
    }
}

mod permission_tests {
    use super::*;

    #[tokio::test]
    async fn test_public_node_fetchable_by_anyone() {
        let mut storage = storage().await;
        let owner = KeyPair::generate();
        let stranger = KeyPair::generate();

        let node = public_node(&owner, b"open");
        let id1 = node.base().id1().unwrap();
        storage.store(&[node], NOW, false).await.unwrap();

        assert!(storage
            .fetch_single_node(&id1, NOW, &stranger.public_key(), &stranger.public_key())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_private_node_owner_only() {
        let mut storage = storage().await;
        let owner = KeyPair::generate();
        let stranger = KeyPair::generate();

        let node = data_node(&owner, b"secret");
        let id1 = node.base().id1().unwrap();
        storage.store(&[node], NOW, false).await.unwrap();

        assert!(storage
            .fetch_single_node(&id1, NOW, &owner.public_key(), &owner.public_key())
            .await
            .unwrap()
            .is_some());
        assert!(storage
            .fetch_single_node(&id1, NOW, &stranger.public_key(), &stranger.public_key())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_license_grants_target_access() {
        let mut storage = storage().await;
        let issuer = KeyPair::generate();
        let target = KeyPair::generate();
        let stranger = KeyPair::generate();

        let mut node = DataNode::new().unwrap();
        node.base_mut().set_parent_id(&PARENT).unwrap();
        node.base_mut().set_owner(&issuer.public_key()).unwrap();
        node.base_mut().set_creation_time(CREATED).unwrap();
        node.base_mut()
            .set_config_bit(config_bits::IS_LICENSED, true)
            .unwrap();
        node.base_mut().sign(&issuer).unwrap();
        let id1 = node.base().id1().unwrap();

        storage.store(&[Node::Data(node)], NOW, false).await.unwrap();

        // Unlicensed: nobody but the owner can read it.
        assert!(storage
            .fetch_single_node(&id1, NOW, &issuer.public_key(), &target.public_key())
            .await
            .unwrap()
            .is_none());

        let license = license_for(&issuer, &target, &id1, CREATED + 10);
        storage.store(&[license], NOW + 10, false).await.unwrap();

        assert!(storage
            .fetch_single_node(&id1, NOW + 20, &issuer.public_key(), &target.public_key())
            .await
            .unwrap()
            .is_some());
        assert!(storage
            .fetch_single_node(
                &id1,
                NOW + 20,
                &issuer.public_key(),
                &stranger.public_key()
            )
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_rights_by_association_follows_ref() {
        let mut storage = storage().await;
        let owner = KeyPair::generate();
        let reader = KeyPair::generate();

        // The anchor node is public, so anyone may read associates.
        let anchor = public_node(&owner, b"anchor");
        let anchor_id1 = anchor.base().id1().unwrap();

        let mut associate = DataNode::new().unwrap();
        associate.base_mut().set_parent_id(&PARENT).unwrap();
        associate
            .base_mut()
            .set_owner(&owner.public_key())
            .unwrap();
        associate.base_mut().set_creation_time(CREATED).unwrap();
        associate
            .base_mut()
            .set_config_bit(config_bits::HAS_RIGHTS_BY_ASSOCIATION, true)
            .unwrap();
        associate.base_mut().set_ref_id(&anchor_id1).unwrap();
        associate.base_mut().sign(&owner).unwrap();
        let associate_id1 = associate.base().id1().unwrap();

        storage
            .store(&[anchor, Node::Data(associate)], NOW, false)
            .await
            .unwrap();

        assert!(storage
            .fetch_single_node(
                &associate_id1,
                NOW,
                &reader.public_key(),
                &reader.public_key()
            )
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_root_eligibility_refusals() {
        let mut storage = storage().await;
        let owner = KeyPair::generate();
        let stranger = KeyPair::generate();

        let query = |root: [u8; 32], target: [u8; 32]| RootQuery {
            root_id1: root,
            target_public_key: target,
            region: None,
            jurisdiction: None,
        };

        // Not found.
        let (node, reason) = storage
            .get_root_node(&query([0xEE; 32], owner.public_key()), NOW)
            .await
            .unwrap();
        assert!(node.is_none());
        assert_eq!(
            reason.unwrap(),
            "The root node is not found but expected to exist."
        );

        // Private, requester is not the owner.
        let private = data_node(&owner, b"private root");
        let private_id = private.base().id1().unwrap();
        storage.store(&[private], NOW, false).await.unwrap();
        let (_, reason) = storage
            .get_root_node(&query(private_id, stranger.public_key()), NOW)
            .await
            .unwrap();
        assert_eq!(
            reason.unwrap(),
            "Access to requested root node is not allowed."
        );

        // Licensed root.
        let mut licensed = DataNode::new().unwrap();
        licensed.base_mut().set_parent_id(&PARENT).unwrap();
        licensed
            .base_mut()
            .set_owner(&owner.public_key())
            .unwrap();
        licensed.base_mut().set_creation_time(CREATED).unwrap();
        licensed
            .base_mut()
            .set_config_bit(config_bits::IS_LICENSED, true)
            .unwrap();
        licensed.base_mut().sign(&owner).unwrap();
        let licensed_id = licensed.base().id1().unwrap();
        storage
            .store(&[Node::Data(licensed)], NOW, false)
            .await
            .unwrap();
        let (_, reason) = storage
            .get_root_node(&query(licensed_id, owner.public_key()), NOW)
            .await
            .unwrap();
        assert_eq!(reason.unwrap(), "Licensed node cannot be used as root node.");

        // Begin-restrictive-write root.
        let mut restrictive = DataNode::new().unwrap();
        restrictive.base_mut().set_parent_id(&PARENT).unwrap();
        restrictive
            .base_mut()
            .set_owner(&owner.public_key())
            .unwrap();
        restrictive.base_mut().set_creation_time(CREATED).unwrap();
        restrictive
            .base_mut()
            .set_config_bit(config_bits::IS_BEGIN_RESTRICTIVEWRITE_MODE, true)
            .unwrap();
        restrictive.base_mut().sign(&owner).unwrap();
        let restrictive_id = restrictive.base().id1().unwrap();
        storage
            .store(&[Node::Data(restrictive)], NOW, false)
            .await
            .unwrap();
        let (_, reason) = storage
            .get_root_node(&query(restrictive_id, owner.public_key()), NOW)
            .await
            .unwrap();
        assert_eq!(
            reason.unwrap(),
            "Begin restrictive writer mode node cannot be used as root node."
        );

        // Rights-by-association root.
        let anchor = public_node(&owner, b"anchor");
        let anchor_id = anchor.base().id1().unwrap();
        let mut associated = DataNode::new().unwrap();
        associated.base_mut().set_parent_id(&PARENT).unwrap();
        associated
            .base_mut()
            .set_owner(&owner.public_key())
            .unwrap();
        associated.base_mut().set_creation_time(CREATED).unwrap();
        associated
            .base_mut()
            .set_config_bit(config_bits::HAS_RIGHTS_BY_ASSOCIATION, true)
            .unwrap();
        associated.base_mut().set_ref_id(&anchor_id).unwrap();
        associated.base_mut().sign(&owner).unwrap();
        let associated_id = associated.base().id1().unwrap();
        storage
            .store(&[anchor, Node::Data(associated)], NOW, false)
            .await
            .unwrap();
        let (_, reason) = storage
            .get_root_node(&query(associated_id, owner.public_key()), NOW)
            .await
            .unwrap();
        assert_eq!(reason.unwrap(), "Root node cannot use hasRightsByAssociation.");

        // An eligible root resolves.
        let open = public_node(&owner, b"eligible root");
        let open_id = open.base().id1().unwrap();
        storage.store(&[open], NOW, false).await.unwrap();
        let (node, reason) = storage
            .get_root_node(&query(open_id, stranger.public_key()), NOW)
            .await
            .unwrap();
        assert!(reason.is_none());
        assert_eq!(node.unwrap().base().id1(), Some(open_id));
    }

    #[tokio::test]
    async fn test_region_bound_root() {
        let mut storage = storage().await;
        let owner = KeyPair::generate();

        let mut node = DataNode::new().unwrap();
        node.base_mut().set_parent_id(&PARENT).unwrap();
        node.base_mut().set_owner(&owner.public_key()).unwrap();
        node.base_mut().set_creation_time(CREATED).unwrap();
        node.base_mut()
            .set_config_bit(config_bits::IS_PUBLIC, true)
            .unwrap();
        node.base_mut().set_region("se").unwrap();
        node.base_mut().sign(&owner).unwrap();
        let id1 = node.base().id1().unwrap();
        storage.store(&[Node::Data(node)], NOW, false).await.unwrap();

        let mut query = RootQuery {
            root_id1: id1,
            target_public_key: owner.public_key(),
            region: Some("us".to_string()),
            jurisdiction: None,
        };
        let (_, reason) = storage.get_root_node(&query, NOW).await.unwrap();
        assert_eq!(
            reason.unwrap(),
            "Access to requested root node is not allowed."
        );

        query.region = Some("se".to_string());
        let (node, reason) = storage.get_root_node(&query, NOW).await.unwrap();
        assert!(reason.is_none());
        assert!(node.is_some());
    }
}

mod freshness_tests {
    use super::*;

    #[tokio::test]
    async fn test_bump_propagates_up_the_trail() {
        let mut storage = storage().await;
        let keypair = KeyPair::generate();

        let root = data_node_under(&keypair, &[0xAA; 32], b"root");
        let root_id = root.base().id1().unwrap();
        let a = data_node_under(&keypair, &root_id, b"a");
        let a_id = a.base().id1().unwrap();
        let b1 = data_node_under(&keypair, &a_id, b"b1");
        let b2 = data_node_under(&keypair, &a_id, b"b2");
        let b1_id = b1.base().id1().unwrap();
        let b2_id = b2.base().id1().unwrap();
        let b1_bump = b1.base().bump_hash().unwrap();

        storage
            .store(&[root, a, b1, b2], NOW, false)
            .await
            .unwrap();

        let bump_at = NOW + 500;
        let parents = storage.bump_nodes(&[b1_bump], bump_at).await.unwrap();
        assert_eq!(parents, vec![a_id]);

        let (b1_update, b1_trail) = storage.node_times(&b1_id).await.unwrap().unwrap();
        assert_eq!(b1_update, bump_at);
        assert_eq!(b1_trail, bump_at);

        let (a_update, a_trail) = storage.node_times(&a_id).await.unwrap().unwrap();
        assert_eq!(a_update, NOW);
        assert_eq!(a_trail, bump_at);

        let (_, root_trail) = storage.node_times(&root_id).await.unwrap().unwrap();
        assert_eq!(root_trail, bump_at);

        let (b2_update, b2_trail) = storage.node_times(&b2_id).await.unwrap().unwrap();
        assert_eq!(b2_update, NOW);
        assert_eq!(b2_trail, NOW);
    }

    #[tokio::test]
    async fn test_bump_is_monotone_and_idempotent() {
        let mut storage = storage().await;
        let keypair = KeyPair::generate();

        let node = data_node(&keypair, b"clocked");
        let id1 = node.base().id1().unwrap();
        let bump = node.base().bump_hash().unwrap();
        storage.store(&[node], NOW, false).await.unwrap();

        storage.bump_nodes(&[bump], NOW + 100).await.unwrap();
        let (update, trail) = storage.node_times(&id1).await.unwrap().unwrap();
        assert_eq!((update, trail), (NOW + 100, NOW + 100));

        // An older bump never rewinds the clocks.
        storage.bump_nodes(&[bump], NOW + 50).await.unwrap();
        let (update, trail) = storage.node_times(&id1).await.unwrap().unwrap();
        assert_eq!((update, trail), (NOW + 100, NOW + 100));

        // Same-time bump is idempotent.
        storage.bump_nodes(&[bump], NOW + 100).await.unwrap();
        let (update, trail) = storage.node_times(&id1).await.unwrap().unwrap();
        assert_eq!((update, trail), (NOW + 100, NOW + 100));
    }

    #[tokio::test]
    async fn test_new_license_bumps_its_target() {
        let mut storage = storage().await;
        let issuer = KeyPair::generate();
        let target = KeyPair::generate();

        let mut node = DataNode::new().unwrap();
        node.base_mut().set_parent_id(&PARENT).unwrap();
        node.base_mut().set_owner(&issuer.public_key()).unwrap();
        node.base_mut().set_creation_time(CREATED).unwrap();
        node.base_mut()
            .set_config_bit(config_bits::IS_LICENSED, true)
            .unwrap();
        node.base_mut().sign(&issuer).unwrap();
        let id1 = node.base().id1().unwrap();

        storage.store(&[Node::Data(node)], NOW, false).await.unwrap();

        let license = license_for(&issuer, &target, &id1, CREATED + 10);
        storage.store(&[license], NOW + 300, false).await.unwrap();

        let (update, trail) = storage.node_times(&id1).await.unwrap().unwrap();
        assert_eq!(update, NOW + 300);
        assert_eq!(trail, NOW + 300);
    }
}

mod blob_tests {
    use super::*;

    #[tokio::test]
    async fn test_write_finalize_read_across_fragments() {
        let mut blobs = blob_storage().await;
        let fragment_size = BLOB_FRAGMENT_SIZE as u64;
        let node_id1 = [0x11; 32];
        let client = [0x22; 32];
        let data_id = derive_data_id(&node_id1, &client);

        // A full fragment's worth written at offset 1 spans fragments 0-1.
        let fragment1: Vec<u8> = (0..BLOB_FRAGMENT_SIZE).map(|i| (i % 251) as u8).collect();
        blobs.write_blob(&data_id, 1, &fragment1).await.unwrap();
        // One byte at the very end of fragment 1 zero-fills the gap.
        blobs
            .write_blob(&data_id, fragment_size * 2 - 1, &[0])
            .await
            .unwrap();

        let mut expected = vec![0u8; 2 * BLOB_FRAGMENT_SIZE];
        expected[1..=BLOB_FRAGMENT_SIZE].copy_from_slice(&fragment1);

        assert_eq!(
            blobs.read_blob_intermediary_length(&data_id).await.unwrap(),
            2 * fragment_size
        );

        let digest = hash_bytes(&expected);
        blobs
            .finalize_write_blob(&node_id1, &data_id, 2 * fragment_size, &digest, NOW)
            .await
            .unwrap();

        let read = blobs
            .read_blob(&node_id1, 0, 2 * fragment_size)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, expected);

        // Ranged reads crossing the fragment boundary are byte-exact.
        let window = blobs
            .read_blob(&node_id1, fragment_size - 3, 6)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            window,
            &expected[(fragment_size - 3) as usize..(fragment_size + 3) as usize]
        );

        // Reads past the end clamp.
        let tail = blobs
            .read_blob(&node_id1, 2 * fragment_size - 2, 100)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tail.len(), 2);
    }

    #[tokio::test]
    async fn test_wrong_hash_purges_fragments() {
        let mut blobs = blob_storage().await;
        let node_id1 = [0x31; 32];
        let data_id = derive_data_id(&node_id1, &[0x32; 32]);

        blobs.write_blob(&data_id, 0, b"some bytes").await.unwrap();
        let err = blobs
            .finalize_write_blob(&node_id1, &data_id, 10, &[0xAB; 32], NOW)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::BlobHashMismatch));

        assert_eq!(blobs.read_blob_intermediary_length(&data_id).await.unwrap(), 0);
        assert!(blobs.read_blob(&node_id1, 0, 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finalized_fragments_are_write_once() {
        let mut blobs = blob_storage().await;
        let node_id1 = [0x41; 32];
        let data_id = derive_data_id(&node_id1, &[0x42; 32]);

        let payload = b"immutable payload".to_vec();
        blobs.write_blob(&data_id, 0, &payload).await.unwrap();
        let digest = hash_bytes(&payload);
        blobs
            .finalize_write_blob(&node_id1, &data_id, payload.len() as u64, &digest, NOW)
            .await
            .unwrap();

        // Overwrites after finalization silently no-op.
        blobs
            .write_blob_fragment(&data_id, b"OVERWRITTEN", 0)
            .await
            .unwrap();
        let read = blobs
            .read_blob(&node_id1, 0, payload.len() as u64)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, payload);
    }

    #[tokio::test]
    async fn test_unfinalized_fragments_last_writer_wins() {
        let mut blobs = blob_storage().await;
        let data_id = derive_data_id(&[0x51; 32], &[0x52; 32]);

        blobs
            .write_blob_fragment(&data_id, b"first", 0)
            .await
            .unwrap();
        blobs
            .write_blob_fragment(&data_id, b"second", 0)
            .await
            .unwrap();
        assert_eq!(
            blobs.read_blob_intermediary_length(&data_id).await.unwrap(),
            6
        );
    }

    #[tokio::test]
    async fn test_oversize_fragment_rejected() {
        let mut blobs = blob_storage().await;
        let data_id = derive_data_id(&[0x61; 32], &[0x62; 32]);
        let oversize = vec![0u8; BLOB_FRAGMENT_SIZE + 1];
        let err = blobs
            .write_blob_fragment(&data_id, &oversize, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::FragmentTooLarge(_)));
    }

    #[tokio::test]
    async fn test_copy_and_delete_with_gc() {
        let mut blobs = blob_storage().await;
        let src = [0x71; 32];
        let dst = [0x72; 32];
        let data_id = derive_data_id(&src, &[0x73; 32]);

        // Copying an unfinalized blob reports false.
        assert!(!blobs.copy_blob(&src, &dst, NOW).await.unwrap());

        let payload = b"shared payload".to_vec();
        blobs.write_blob(&data_id, 0, &payload).await.unwrap();
        let digest = hash_bytes(&payload);
        blobs
            .finalize_write_blob(&src, &data_id, payload.len() as u64, &digest, NOW)
            .await
            .unwrap();

        assert!(blobs.copy_blob(&src, &dst, NOW + 10).await.unwrap());

        // Deleting the source keeps the shared fragments alive.
        blobs.delete_blobs(&[src]).await.unwrap();
        let read = blobs
            .read_blob(&dst, 0, payload.len() as u64)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, payload);

        // Deleting the last reference garbage-collects the fragments.
        blobs.delete_blobs(&[dst]).await.unwrap();
        assert!(blobs
            .read_blob(&dst, 0, payload.len() as u64)
            .await
            .unwrap()
            .is_none());
        assert_eq!(blobs.read_blob_intermediary_length(&data_id).await.unwrap(), 0);
    }
}
