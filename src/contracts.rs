//! Custody contract ABI definitions
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the custody
//! contract's withdrawal interface. Event signatures and function selectors
//! must stay byte-exact with the deployed contract; `tests` below pin them.

use alloy::sol;

sol! {
    /// Two-phase withdrawal interface of the custody contract.
    ///
    /// The initiator (exchange operator) calls `startWithdraw`; the guard
    /// role calls `finalizeWithdraw` or `rejectWithdraw` before funds move.
    #[sol(rpc)]
    contract ICustody {
        // ====================================================================
        // Withdrawal Methods
        // ====================================================================

        /// Initiator requests moving funds to a user. Returns the contract
        /// derived withdrawal id. Not called by the guard.
        function startWithdraw(address user, address token, uint256 amount, uint256 nonce)
            external returns (bytes32 withdrawalId);

        /// Guard releases the requested funds.
        function finalizeWithdraw(bytes32 withdrawalId) external;

        /// Guard cancels the request.
        function rejectWithdraw(bytes32 withdrawalId) external;

        // ====================================================================
        // Events
        // ====================================================================

        /// Emitted when `startWithdraw` is mined.
        event WithdrawStarted(
            bytes32 indexed withdrawalId,
            address indexed user,
            address indexed token,
            uint256 amount,
            uint256 nonce
        );

        /// Emitted when the guard finalizes or the finalize settles.
        event WithdrawFinalized(bytes32 indexed withdrawalId, bool success);

        /// Emitted when funds are deposited into custody.
        event Deposited(address indexed user, address indexed token, uint256 amount);
    }
}
