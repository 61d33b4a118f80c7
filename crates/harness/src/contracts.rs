//! Contract ABIs and well-known addresses used by the pipeline and the daemons.
//!
//! The contracts themselves are opaque: only the calls the harness issues or decodes are
//! declared here.

use alloy_core::primitives::{Address, B256, U256, address, keccak256};
use alloy_sol_types::{SolValue, sol};

sol! {
    /// Arguments of a direct L1 → L2 transaction request.
    #[derive(Debug, PartialEq, Eq)]
    struct L2TransactionRequestDirect {
        uint256 chainId;
        uint256 mintValue;
        address l2Contract;
        uint256 l2Value;
        bytes l2Calldata;
        uint256 l2GasLimit;
        uint256 l2GasPerPubdataByteLimit;
        bytes[] factoryDeps;
        address refundRecipient;
    }

    function requestL2TransactionDirect(L2TransactionRequestDirect request) external payable returns (bytes32 canonicalTxHash);

    function l2TransactionBaseCost(uint256 chainId, uint256 gasPrice, uint256 l2GasLimit, uint256 l2GasPerPubdataByteLimit) external view returns (uint256);

    function acceptAdmin() external;

    function pendingAdmin() external view returns (address);

    function chainTypeManagerIsRegistered(address chainTypeManager) external view returns (bool);

    function initL2(uint256 l1ChainId, address owner, uint256 maxNumberOfZKChains) external;

    /// Batch metadata as stored by the settlement contract after commit.
    #[derive(Debug, PartialEq, Eq)]
    struct StoredBatchInfo {
        uint64 batchNumber;
        bytes32 batchHash;
        uint64 indexRepeatedStorageChanges;
        uint256 numberOfLayer1Txs;
        bytes32 priorityOperationsHash;
        bytes32 l2LogsTreeRoot;
        uint256 timestamp;
        bytes32 commitment;
    }

    #[derive(Debug, PartialEq, Eq)]
    struct CommitBatchInfo {
        uint64 batchNumber;
        uint256 timestamp;
        uint64 indexRepeatedStorageChanges;
        bytes32 newStateRoot;
        uint256 numberOfLayer1Txs;
        bytes32 priorityOperationsHash;
        bytes32 bootloaderHeapInitialContentsHash;
        bytes32 eventsQueueStateHash;
        bytes systemLogs;
        bytes operatorDAInput;
    }

    #[derive(Debug, PartialEq, Eq)]
    struct ProofInput {
        uint256[] recursiveAggregationInput;
        uint256[] serializedProof;
    }

    function commitBatchesSharedBridge(uint256 chainId, StoredBatchInfo lastCommittedBatchData, CommitBatchInfo[] newBatchesData) external;

    function proveBatchesSharedBridge(uint256 chainId, StoredBatchInfo prevBatch, StoredBatchInfo[] committedBatches, ProofInput proof) external;

    function executeBatchesSharedBridge(uint256 chainId, StoredBatchInfo[] batchesData) external;

    /// Payload of a transaction sent to [`CROSS_CHAIN_MESSENGER`], ABI-encoded as parameters.
    #[derive(Debug, PartialEq, Eq)]
    struct CrossChainMessage {
        uint256 targetChainId;
        address targetAddress;
        bytes targetCalldata;
    }
}

/// Marker address watched by the L2 → L2 relayer.
pub const CROSS_CHAIN_MESSENGER: Address = address!("0000000000000000000000000000000000000420");

/// Conventional address of the base token (ETH).
pub const ETH_TOKEN_ADDRESS: Address = address!("0000000000000000000000000000000000000001");

pub const L2_BRIDGEHUB: Address = address!("0000000000000000000000000000000000010002");
pub const L2_ASSET_ROUTER: Address = address!("0000000000000000000000000000000000010003");
pub const L2_NATIVE_TOKEN_VAULT: Address = address!("0000000000000000000000000000000000010004");

/// Gas per pubdata byte used for every direct request.
pub const DEFAULT_GAS_PER_PUBDATA: u64 = 800;

/// Upper bound on registered chains passed to the L2 bridgehub at initialization.
pub const MAX_NUMBER_OF_CHAINS: u64 = 100;

/// A system contract installed on rollup chains with `anvil_setCode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemContract {
    pub name: &'static str,
    pub address: Address,
    /// Foundry artifact path, relative to the artifacts directory.
    pub artifact: &'static str,
}

/// System contracts bootstrapped on every rollup chain, in installation order.
pub const SYSTEM_CONTRACTS: &[SystemContract] = &[
    SystemContract {
        name: "SystemContext",
        address: address!("000000000000000000000000000000000000800b"),
        artifact: "MockSystemContext.sol/MockSystemContext.json",
    },
    SystemContract {
        name: "L2ToL1Messenger",
        address: address!("0000000000000000000000000000000000008008"),
        artifact: "MockL2ToL1Messenger.sol/MockL2ToL1Messenger.json",
    },
    SystemContract {
        name: "L2BaseToken",
        address: address!("000000000000000000000000000000000000800a"),
        artifact: "MockL2BaseToken.sol/MockL2BaseToken.json",
    },
    SystemContract {
        name: "L2Bridgehub",
        address: L2_BRIDGEHUB,
        artifact: "L2Bridgehub.sol/L2Bridgehub.json",
    },
    SystemContract {
        name: "InteropCenter",
        address: address!("000000000000000000000000000000000001000d"),
        artifact: "InteropCenter.sol/InteropCenter.json",
    },
    SystemContract {
        name: "InteropHandler",
        address: address!("000000000000000000000000000000000001000e"),
        artifact: "InteropHandler.sol/InteropHandler.json",
    },
    SystemContract {
        name: "L2AssetRouter",
        address: L2_ASSET_ROUTER,
        artifact: "L2AssetRouter.sol/L2AssetRouter.json",
    },
    SystemContract {
        name: "L2ChainAssetHandler",
        address: address!("000000000000000000000000000000000001000a"),
        artifact: "L2ChainAssetHandler.sol/L2ChainAssetHandler.json",
    },
    SystemContract {
        name: "L2AssetTracker",
        address: address!("000000000000000000000000000000000001000f"),
        artifact: "L2AssetTracker.sol/L2AssetTracker.json",
    },
    SystemContract {
        name: "L2NativeTokenVault",
        address: L2_NATIVE_TOKEN_VAULT,
        artifact: "L2NativeTokenVault.sol/L2NativeTokenVault.json",
    },
];

/// Asset id of `token` in the native token vault of `chain_id`.
pub fn asset_id(chain_id: u64, token: Address) -> B256 {
    keccak256((U256::from(chain_id), L2_NATIVE_TOKEN_VAULT, token).abi_encode())
}

/// Asset id of the base token of `chain_id`.
pub fn eth_asset_id(chain_id: u64) -> B256 {
    asset_id(chain_id, ETH_TOKEN_ADDRESS)
}

#[cfg(test)]
mod tests {
    use alloy_core::primitives::Bytes;
    use alloy_sol_types::SolCall;

    use super::*;

    #[test]
    fn test_asset_id_matches_manual_encoding() {
        let mut encoded = [0u8; 96];
        encoded[31] = 1;
        encoded[44..64].copy_from_slice(L2_NATIVE_TOKEN_VAULT.as_slice());
        encoded[76..96].copy_from_slice(ETH_TOKEN_ADDRESS.as_slice());

        assert_eq!(eth_asset_id(1), keccak256(encoded));
        assert_ne!(eth_asset_id(1), eth_asset_id(2));
    }

    #[test]
    fn test_request_direct_decodes_from_calldata() {
        let request = L2TransactionRequestDirect {
            chainId: U256::from(12),
            mintValue: U256::ZERO,
            l2Contract: Address::repeat_byte(0xab),
            l2Value: U256::from(5),
            l2Calldata: Bytes::from_static(&[0xde, 0xad]),
            l2GasLimit: U256::from(1_000_000),
            l2GasPerPubdataByteLimit: U256::from(DEFAULT_GAS_PER_PUBDATA),
            factoryDeps: vec![Bytes::from_static(&[1])],
            refundRecipient: Address::ZERO,
        };
        let calldata = requestL2TransactionDirectCall {
            request: request.clone(),
        }
        .abi_encode();

        let decoded = requestL2TransactionDirectCall::abi_decode(&calldata, true).unwrap();
        assert_eq!(decoded.request, request);
    }

    #[test]
    fn test_system_contract_addresses_are_unique() {
        let mut addresses: Vec<_> = SYSTEM_CONTRACTS.iter().map(|c| c.address).collect();
        addresses.sort();
        addresses.dedup();
        assert_eq!(addresses.len(), SYSTEM_CONTRACTS.len());
    }
}
