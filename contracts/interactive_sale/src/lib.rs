#![cfg_attr(not(feature = "std"), no_std, no_main)]

/// # Interactive Coin Offering — Sale Ledger
///
/// **Role:** escrow, ordering and clearing engine for an interactive token
/// sale. Every buyer declares a personal maximum acceptable project
/// valuation; the ledger continuously reconciles which bids are "in" as the
/// aggregate accepted contribution moves, and converges on a single clearing
/// valuation at sale close.
///
/// **Architecture:**
/// ```text
///   [buyer] ──submit_bid──► [bucket chain] ──auto-activate (uncapped only)
///                                │
///   [keeper] ──poke_in/out──► [active set] ⇄ [inactive set]   (bounty paid)
///                                │
///   [buyer] ──withdraw──► refund (phase-gated, bonus forfeit)
///                                │
///   after end_time:  finalize() ──► beneficiary;  redeem(bid) ──► tokens
/// ```
///
/// The bucket chain is a doubly-linked list over discretized valuation
/// levels held in a `Mapping`; buckets and bids reference each other only by
/// integer index. An uncapped bid can never be displaced from above, so it
/// activates unconditionally at submission; every capped bid enters inactive
/// and is flipped by incentivized third-party pokes, which keeps submission
/// cost proportional to the hint distance instead of the bid count.
///
/// **Phase schedule** (timestamps, strictly increasing):
/// ```text
///   ┌──────────────┬──────────────────────────────┬───────────────────────┐
///   │ Phase        │ Bonus rate                   │ Withdrawal            │
///   ├──────────────┼──────────────────────────────┼───────────────────────┤
///   │ Full bonus   │ max_bonus_rate, flat         │ full refund           │
///   │ Partial      │ linear decay to 0 at end     │ earned bonus forfeit  │
///   │ Lock-up      │ same decay                   │ forbidden             │
///   │ Closed       │ —                            │ redemption only       │
///   └──────────────┴──────────────────────────────┴───────────────────────┘
/// ```
///
/// A bid's bonus rate is fixed the moment it is submitted and inflates its
/// weight in the final pro-rata token split without requiring extra funds.
#[ink::contract]
mod interactive_sale {
    use ink::env::call::{build_call, ExecutionInput, Selector};
    use ink::env::DefaultEnvironment;
    use ink::prelude::vec::Vec;
    use ink::storage::Mapping;
    use primitive_types::U256;

    // =========================================================================
    // CONSTANTS
    // =========================================================================

    /// Denominator of the bonus-rate fixed point (parts per billion).
    pub const BONUS_RATE_DIVISOR: u64 = 1_000_000_000;

    /// Bounty reserved from every bid for the caller who pokes it in:
    /// 0.01 native tokens (18 decimals).
    pub const POKE_IN_REWARD: Balance = 10_000_000_000_000_000;

    /// Bounty reserved from every bid for the caller who pokes it out.
    pub const POKE_OUT_REWARD: Balance = 10_000_000_000_000_000;

    // =========================================================================
    // STORAGE
    // =========================================================================

    /// A node of the valuation-sorted bucket chain. Present in the mapping
    /// iff linked. The head (index 0) and the sentinel uncapped bucket
    /// (index `bucket_count − 1`) are created at construction and never
    /// unlinked; every other node lives exactly as long as it holds bids.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, scale::Encode, scale::Decode)]
    #[cfg_attr(
        feature = "std",
        derive(scale_info::TypeInfo, ink::storage::traits::StorageLayout)
    )]
    pub struct Bucket {
        pub prev: u32,
        pub next: u32,
        /// Bids currently anchored at this valuation level.
        pub bid_count: u32,
    }

    /// One bid record. `upper_bound` is the bid's own bucket node;
    /// `lower_bound` is the chain node directly below it at insertion time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, scale::Encode, scale::Decode)]
    #[cfg_attr(
        feature = "std",
        derive(scale_info::TypeInfo, ink::storage::traits::StorageLayout)
    )]
    pub struct Bid {
        /// Maximum total raise at which the contributor still wants in.
        pub valuation_cap: Balance,
        /// The valuation the contributor suggested as a search start.
        pub search_hint: Balance,
        /// Escrowed funds net of the two reserved poke bounties.
        pub contribution: Balance,
        pub contributor: AccountId,
        pub withdrawn: bool,
        pub redeemed: bool,
        pub active: bool,
        pub lower_bound: u32,
        pub upper_bound: u32,
        pub submitted_at: Timestamp,
        /// Bonus rate earned at submission, in parts per billion. Never
        /// recomputed afterwards.
        pub bonus_rate: u64,
        /// Remaining reserved bounties; zeroed when consumed or refunded.
        pub poke_in_reward: Balance,
        pub poke_out_reward: Balance,
    }

    #[ink(storage)]
    pub struct InteractiveSale {
        // ── Access control ────────────────────────────────────────────────
        owner: AccountId,
        beneficiary: AccountId,

        // ── Phase boundaries ──────────────────────────────────────────────
        start_time: Timestamp,
        end_full_bonus_time: Timestamp,
        withdrawal_lock_time: Timestamp,
        end_time: Timestamp,

        // ── Sale parameters ───────────────────────────────────────────────
        max_bonus_rate: u64,
        min_valuation: Balance,
        max_valuation: Balance,
        bucket_increment: Balance,
        bucket_count: u32,

        // ── Ledger ────────────────────────────────────────────────────────
        last_bid_id: u64,
        bids: Mapping<u64, Bid>,
        buckets: Mapping<u32, Bucket>,

        // ── Cached aggregates ─────────────────────────────────────────────
        /// Sum of `contribution` over all active bids.
        sum_accepted_contrib: Balance,
        /// Sum of `contribution · (1 + bonus_rate)` over all active bids.
        sum_accepted_virtual_contrib: Balance,
        /// Partial-withdrawal penalties owed to the beneficiary at close.
        forfeited_funds: Balance,

        // ── Token collaborator ────────────────────────────────────────────
        token: Option<AccountId>,
        tokens_for_sale: Balance,

        finalized: bool,
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    #[ink(event)]
    pub struct BidSubmitted {
        #[ink(topic)]
        contributor: AccountId,
        #[ink(topic)]
        bid_id: u64,
        bucket: u32,
        contribution: Balance,
    }

    /// Emitted when a third party activates an eligible inactive bid.
    #[ink(event)]
    pub struct PokeIn {
        #[ink(topic)]
        poker: AccountId,
        #[ink(topic)]
        bid_id: u64,
    }

    /// Emitted when a third party deactivates a priced-out active bid.
    #[ink(event)]
    pub struct PokeOut {
        #[ink(topic)]
        poker: AccountId,
        #[ink(topic)]
        bid_id: u64,
    }

    #[ink(event)]
    pub struct BidWithdrawn {
        #[ink(topic)]
        contributor: AccountId,
        #[ink(topic)]
        bid_id: u64,
        refund: Balance,
        forfeited: Balance,
    }

    /// Emitted once when the owner wires up the token collaborator and the
    /// for-sale supply is snapshotted.
    #[ink(event)]
    pub struct TokenConfigured {
        #[ink(topic)]
        token: AccountId,
        tokens_for_sale: Balance,
    }

    #[ink(event)]
    pub struct SaleFinalized {
        clearing_valuation: Balance,
        proceeds: Balance,
    }

    #[ink(event)]
    pub struct BidRedeemed {
        #[ink(topic)]
        contributor: AccountId,
        #[ink(topic)]
        bid_id: u64,
        tokens: Balance,
        refund: Balance,
    }

    // =========================================================================
    // ERRORS
    // =========================================================================

    #[derive(Debug, PartialEq, Eq, scale::Encode, scale::Decode)]
    #[cfg_attr(feature = "std", derive(scale_info::TypeInfo))]
    pub enum Error {
        /// Time-gated call outside its valid phase.
        OutsideSaleWindow,
        /// Transferred value does not cover the two reserved poke bounties.
        InsufficientContribution,
        /// State-dependent poke precondition unmet — the caller's view of
        /// the aggregate is stale.
        PokeNotEligible,
        /// The current phase forbids exiting the bid.
        WithdrawalNotAllowed,
        /// The bid has already been redeemed.
        AlreadyRedeemed,
        /// The bid has already been withdrawn.
        AlreadyWithdrawn,
        /// Redemption attempted before the sale was finalized.
        SaleNotFinalized,
        /// Caller is not permitted to perform this call.
        Unauthorized,
        /// No bid exists under the given identifier.
        UnknownBid,
        /// The token collaborator has already been configured.
        TokenAlreadySet,
        /// The token collaborator has not been configured yet.
        TokenNotSet,
        /// The sale has already been finalized.
        AlreadyFinalized,
        /// An arithmetic operation overflowed.
        Overflow,
        /// A native value transfer failed.
        TransferFailed,
        /// A cross-contract call to the token collaborator failed.
        TokenCallFailed,
    }

    // =========================================================================
    // IMPLEMENTATION
    // =========================================================================

    impl InteractiveSale {
        // ---------------------------------------------------------------------
        // Constructor
        // ---------------------------------------------------------------------

        /// Deploy the sale ledger.
        ///
        /// Phase boundaries are derived from `start_time` plus the three
        /// phase durations (milliseconds). `max_bonus_rate` is parts per
        /// billion; `bucket_increment` fixes the valuation discretization,
        /// giving `(max_valuation − min_valuation) / bucket_increment + 1`
        /// buckets of which the last is the sentinel "uncapped" level.
        #[ink(constructor)]
        pub fn new(
            start_time: Timestamp,
            full_bonus_length: Timestamp,
            partial_withdrawal_length: Timestamp,
            withdrawal_lockup_length: Timestamp,
            max_bonus_rate: u64,
            beneficiary: AccountId,
            min_valuation: Balance,
            max_valuation: Balance,
            bucket_increment: Balance,
        ) -> Self {
            assert!(full_bonus_length > 0, "full-bonus phase must not be empty");
            assert!(
                partial_withdrawal_length > 0,
                "partial-withdrawal phase must not be empty"
            );
            assert!(
                withdrawal_lockup_length > 0,
                "lock-up phase must not be empty"
            );
            assert!(
                max_bonus_rate <= BONUS_RATE_DIVISOR,
                "bonus rate exceeds its divisor"
            );
            assert!(bucket_increment > 0, "bucket increment must be positive");
            assert!(
                max_valuation > min_valuation,
                "valuation range must not be empty"
            );

            let span = (max_valuation - min_valuation) / bucket_increment + 1;
            assert!(
                (3..=u32::MAX as Balance).contains(&span),
                "bucket count out of range"
            );
            let bucket_count = span as u32;
            let tail = bucket_count - 1;

            let mut buckets = Mapping::default();
            buckets.insert(
                0u32,
                &Bucket {
                    prev: 0,
                    next: tail,
                    bid_count: 0,
                },
            );
            buckets.insert(
                tail,
                &Bucket {
                    prev: 0,
                    next: tail,
                    bid_count: 0,
                },
            );

            let end_full_bonus_time = start_time + full_bonus_length;
            let withdrawal_lock_time = end_full_bonus_time + partial_withdrawal_length;
            let end_time = withdrawal_lock_time + withdrawal_lockup_length;

            Self {
                owner: Self::env().caller(),
                beneficiary,
                start_time,
                end_full_bonus_time,
                withdrawal_lock_time,
                end_time,
                max_bonus_rate,
                min_valuation,
                max_valuation,
                bucket_increment,
                bucket_count,
                last_bid_id: 0,
                bids: Mapping::default(),
                buckets,
                sum_accepted_contrib: 0,
                sum_accepted_virtual_contrib: 0,
                forfeited_funds: 0,
                token: None,
                tokens_for_sale: 0,
                finalized: false,
            }
        }

        // =====================================================================
        // SUBMISSION
        // =====================================================================

        /// Place a bid capped at `valuation_cap`, escrowing the transferred
        /// value. `search_hint` is a valuation near the cap used as the
        /// chain-walk starting point; a poor hint costs traversal steps,
        /// never correctness.
        ///
        /// A cap at or above `max_valuation` lands in the sentinel uncapped
        /// bucket and activates immediately; every capped bid enters
        /// inactive and waits for a poke. Two fixed bounties are reserved
        /// out of the transferred value before the contribution is recorded.
        ///
        /// Returns the fresh bid identifier.
        #[ink(message, payable)]
        pub fn submit_bid(
            &mut self,
            valuation_cap: Balance,
            search_hint: Balance,
        ) -> Result<u64, Error> {
            let now = self.env().block_timestamp();
            if now < self.start_time || now >= self.end_time {
                return Err(Error::OutsideSaleWindow);
            }

            let value = self.env().transferred_value();
            let reserved = POKE_IN_REWARD + POKE_OUT_REWARD;
            if value <= reserved {
                return Err(Error::InsufficientContribution);
            }
            let contribution = value - reserved;

            let target = self.node_of_cap(valuation_cap);
            let lower = self.anchor_bid(target, search_hint);

            let bonus_rate = self.bonus_rate_at(now);
            let sentinel = target == self.bucket_count - 1;

            let bid_id = self.last_bid_id.checked_add(1).ok_or(Error::Overflow)?;
            self.last_bid_id = bid_id;

            let contributor = self.env().caller();
            let bid = Bid {
                valuation_cap,
                search_hint,
                contribution,
                contributor,
                withdrawn: false,
                redeemed: false,
                active: sentinel,
                lower_bound: lower,
                upper_bound: target,
                submitted_at: now,
                bonus_rate,
                poke_in_reward: POKE_IN_REWARD,
                poke_out_reward: POKE_OUT_REWARD,
            };

            if sentinel {
                self.sum_accepted_contrib = self
                    .sum_accepted_contrib
                    .checked_add(contribution)
                    .ok_or(Error::Overflow)?;
                self.sum_accepted_virtual_contrib = self
                    .sum_accepted_virtual_contrib
                    .checked_add(Self::virtual_contribution(contribution, bonus_rate)?)
                    .ok_or(Error::Overflow)?;
            }
            self.bids.insert(bid_id, &bid);

            self.env().emit_event(BidSubmitted {
                contributor,
                bid_id,
                bucket: target,
                contribution,
            });

            Ok(bid_id)
        }

        // =====================================================================
        // RECONCILIATION — poke-in / poke-out
        // =====================================================================

        /// Activate inactive bids whose caps tolerate the grown aggregate.
        ///
        /// IDs are processed in array order; an earlier activation raises
        /// the aggregate seen by later entries, so a single call can cascade
        /// a chain reaction when the caller supplies the right order. The
        /// first ineligible entry fails the whole call — batches are never
        /// partially applied on-chain.
        ///
        /// Every successful activation pays the bid's reserved poke-in
        /// bounty to the caller, in one transfer after the batch.
        #[ink(message)]
        pub fn poke_in(&mut self, bid_ids: Vec<u64>) -> Result<(), Error> {
            let now = self.env().block_timestamp();
            if now < self.start_time || now >= self.end_time {
                return Err(Error::OutsideSaleWindow);
            }

            let poker = self.env().caller();
            let mut payout: Balance = 0;

            for bid_id in bid_ids {
                let mut bid = self.bids.get(bid_id).ok_or(Error::UnknownBid)?;
                if bid.withdrawn {
                    return Err(Error::AlreadyWithdrawn);
                }
                if bid.redeemed {
                    return Err(Error::AlreadyRedeemed);
                }
                let grown = self
                    .sum_accepted_contrib
                    .checked_add(bid.contribution)
                    .ok_or(Error::Overflow)?;
                // Activating the bid must not violate its own cap.
                if bid.active || bid.valuation_cap < grown {
                    return Err(Error::PokeNotEligible);
                }

                bid.active = true;
                self.sum_accepted_contrib = grown;
                self.sum_accepted_virtual_contrib = self
                    .sum_accepted_virtual_contrib
                    .checked_add(Self::virtual_contribution(bid.contribution, bid.bonus_rate)?)
                    .ok_or(Error::Overflow)?;

                payout = payout
                    .checked_add(bid.poke_in_reward)
                    .ok_or(Error::Overflow)?;
                bid.poke_in_reward = 0;
                self.bids.insert(bid_id, &bid);

                self.env().emit_event(PokeIn { poker, bid_id });
            }

            if payout > 0 {
                self.env()
                    .transfer(poker, payout)
                    .map_err(|_| Error::TransferFailed)?;
            }
            Ok(())
        }

        /// Deactivate active bids whose caps the aggregate has overrun.
        /// Symmetric to `poke_in`; pays the poke-out bounty per entry.
        #[ink(message)]
        pub fn poke_out(&mut self, bid_ids: Vec<u64>) -> Result<(), Error> {
            let now = self.env().block_timestamp();
            if now < self.start_time || now >= self.end_time {
                return Err(Error::OutsideSaleWindow);
            }

            let poker = self.env().caller();
            let mut payout: Balance = 0;

            for bid_id in bid_ids {
                let mut bid = self.bids.get(bid_id).ok_or(Error::UnknownBid)?;
                if bid.withdrawn {
                    return Err(Error::AlreadyWithdrawn);
                }
                if bid.redeemed {
                    return Err(Error::AlreadyRedeemed);
                }
                // A cap exactly at the aggregate is still consistent.
                if !bid.active || bid.valuation_cap >= self.sum_accepted_contrib {
                    return Err(Error::PokeNotEligible);
                }

                bid.active = false;
                self.sum_accepted_contrib = self
                    .sum_accepted_contrib
                    .checked_sub(bid.contribution)
                    .ok_or(Error::Overflow)?;
                self.sum_accepted_virtual_contrib = self
                    .sum_accepted_virtual_contrib
                    .checked_sub(Self::virtual_contribution(bid.contribution, bid.bonus_rate)?)
                    .ok_or(Error::Overflow)?;

                payout = payout
                    .checked_add(bid.poke_out_reward)
                    .ok_or(Error::Overflow)?;
                bid.poke_out_reward = 0;
                self.bids.insert(bid_id, &bid);

                self.env().emit_event(PokeOut { poker, bid_id });
            }

            if payout > 0 {
                self.env()
                    .transfer(poker, payout)
                    .map_err(|_| Error::TransferFailed)?;
            }
            Ok(())
        }

        // =====================================================================
        // WITHDRAWAL
        // =====================================================================

        /// Exit a bid before the lock-up phase. In the full-bonus phase the
        /// contribution is refunded in full; in the partial phase the bid's
        /// earned bonus is forfeited from its principal and accrues to the
        /// beneficiary. Unconsumed poke bounties are always returned.
        #[ink(message)]
        pub fn withdraw(&mut self, bid_id: u64) -> Result<(), Error> {
            let mut bid = self.bids.get(bid_id).ok_or(Error::UnknownBid)?;
            if self.env().caller() != bid.contributor {
                return Err(Error::Unauthorized);
            }
            if bid.withdrawn {
                return Err(Error::AlreadyWithdrawn);
            }
            if bid.redeemed {
                return Err(Error::AlreadyRedeemed);
            }
            let now = self.env().block_timestamp();
            if now >= self.withdrawal_lock_time {
                return Err(Error::WithdrawalNotAllowed);
            }

            if bid.active {
                bid.active = false;
                self.sum_accepted_contrib = self
                    .sum_accepted_contrib
                    .checked_sub(bid.contribution)
                    .ok_or(Error::Overflow)?;
                self.sum_accepted_virtual_contrib = self
                    .sum_accepted_virtual_contrib
                    .checked_sub(Self::virtual_contribution(bid.contribution, bid.bonus_rate)?)
                    .ok_or(Error::Overflow)?;
            }

            let forfeited = if now < self.end_full_bonus_time {
                0
            } else {
                bid.contribution
                    .checked_mul(bid.bonus_rate as Balance)
                    .ok_or(Error::Overflow)?
                    / BONUS_RATE_DIVISOR as Balance
            };
            self.forfeited_funds = self
                .forfeited_funds
                .checked_add(forfeited)
                .ok_or(Error::Overflow)?;

            let refund = (bid.contribution - forfeited)
                .checked_add(bid.poke_in_reward)
                .ok_or(Error::Overflow)?
                .checked_add(bid.poke_out_reward)
                .ok_or(Error::Overflow)?;
            bid.poke_in_reward = 0;
            bid.poke_out_reward = 0;
            bid.withdrawn = true;

            self.release_bucket(bid.upper_bound);
            self.bids.insert(bid_id, &bid);

            self.env().emit_event(BidWithdrawn {
                contributor: bid.contributor,
                bid_id,
                refund,
                forfeited,
            });

            self.env()
                .transfer(bid.contributor, refund)
                .map_err(|_| Error::TransferFailed)?;
            Ok(())
        }

        // =====================================================================
        // FINALIZATION & REDEMPTION
        // =====================================================================

        /// Close the sale. The active set and aggregate as of `end_time`
        /// become the clearing state; the raised funds plus forfeited
        /// partial-withdrawal penalties go to the beneficiary.
        #[ink(message)]
        pub fn finalize(&mut self) -> Result<(), Error> {
            let now = self.env().block_timestamp();
            if now < self.end_time {
                return Err(Error::OutsideSaleWindow);
            }
            if self.finalized {
                return Err(Error::AlreadyFinalized);
            }
            if self.token.is_none() {
                return Err(Error::TokenNotSet);
            }

            self.finalized = true;
            let proceeds = self
                .sum_accepted_contrib
                .checked_add(self.forfeited_funds)
                .ok_or(Error::Overflow)?;
            self.forfeited_funds = 0;

            self.env().emit_event(SaleFinalized {
                clearing_valuation: self.sum_accepted_contrib,
                proceeds,
            });

            if proceeds > 0 {
                self.env()
                    .transfer(self.beneficiary, proceeds)
                    .map_err(|_| Error::TransferFailed)?;
            }
            Ok(())
        }

        /// Settle one bid after finalization. A bid that closed active
        /// receives its pro-rata, bonus-weighted share of the for-sale
        /// tokens; a bid that closed inactive receives its contribution
        /// back. Unconsumed bounties are returned either way. Anyone may
        /// trigger settlement; payment always goes to the contributor.
        #[ink(message)]
        pub fn redeem(&mut self, bid_id: u64) -> Result<(), Error> {
            if !self.finalized {
                return Err(Error::SaleNotFinalized);
            }
            let mut bid = self.bids.get(bid_id).ok_or(Error::UnknownBid)?;
            if bid.redeemed {
                return Err(Error::AlreadyRedeemed);
            }
            if bid.withdrawn {
                return Err(Error::AlreadyWithdrawn);
            }

            let mut refund = bid
                .poke_in_reward
                .checked_add(bid.poke_out_reward)
                .ok_or(Error::Overflow)?;
            bid.poke_in_reward = 0;
            bid.poke_out_reward = 0;

            let tokens = if bid.active {
                self.redeemable_tokens(&bid)?
            } else {
                refund = refund
                    .checked_add(bid.contribution)
                    .ok_or(Error::Overflow)?;
                0
            };

            bid.redeemed = true;
            self.bids.insert(bid_id, &bid);

            self.env().emit_event(BidRedeemed {
                contributor: bid.contributor,
                bid_id,
                tokens,
                refund,
            });

            if tokens > 0 {
                let token = self.token.ok_or(Error::TokenNotSet)?;
                self.token_transfer(token, bid.contributor, tokens)?;
            }
            if refund > 0 {
                self.env()
                    .transfer(bid.contributor, refund)
                    .map_err(|_| Error::TransferFailed)?;
            }
            Ok(())
        }

        // =====================================================================
        // ADMIN
        // =====================================================================

        /// Wire up the token collaborator, once. The for-sale supply is
        /// snapshotted from the token's view of this contract's balance at
        /// configuration time and never re-read.
        #[ink(message)]
        pub fn set_token(&mut self, token: AccountId) -> Result<(), Error> {
            if self.env().caller() != self.owner {
                return Err(Error::Unauthorized);
            }
            if self.token.is_some() {
                return Err(Error::TokenAlreadySet);
            }

            let supply = self.token_balance_of(token, self.env().account_id())?;
            self.token = Some(token);
            self.tokens_for_sale = supply;

            self.env().emit_event(TokenConfigured {
                token,
                tokens_for_sale: supply,
            });
            Ok(())
        }

        // =====================================================================
        // INTERNAL — bucket chain
        // =====================================================================

        /// Bucket index of a valuation: `floor` over the increment, clamped
        /// to the bucket range. Used to interpret search hints.
        fn bucket_of(&self, valuation: Balance) -> u32 {
            if valuation >= self.max_valuation {
                return self.bucket_count - 1;
            }
            let offset = valuation.saturating_sub(self.min_valuation);
            (offset / self.bucket_increment) as u32
        }

        /// Chain node a bid with the given cap attaches to: the first
        /// bucket whose valuation level is ≥ the cap. Finite caps clamp to
        /// `[1, bucket_count − 2]` so they land neither on the head (which
        /// anchors every bid from below) nor on the sentinel (which would
        /// make them uncapped).
        fn node_of_cap(&self, cap: Balance) -> u32 {
            if cap >= self.max_valuation {
                return self.bucket_count - 1;
            }
            let offset = cap.saturating_sub(self.min_valuation);
            let mut node = (offset / self.bucket_increment) as u32;
            if offset % self.bucket_increment != 0 {
                node += 1;
            }
            node.clamp(1, self.bucket_count - 2)
        }

        /// Anchor a new bid at `target`, joining the node if it is already
        /// linked and splicing it in otherwise. Returns the chain node
        /// directly below `target`, recorded on the bid as its lower bound.
        fn anchor_bid(&mut self, target: u32, search_hint: Balance) -> u32 {
            if let Some(mut node) = self.buckets.get(target) {
                node.bid_count = node.bid_count.saturating_add(1);
                let lower = node.prev;
                self.buckets.insert(target, &node);
                return lower;
            }

            let hint = self.bucket_of(search_hint);
            let start = if hint < target && self.buckets.contains(hint) {
                hint
            } else {
                0
            };
            let (lower, upper) = self.locate(start, target);
            self.splice_in(lower, target, upper);
            lower
        }

        /// Walk `next` pointers from `start` (a linked node below `target`)
        /// and return the last node strictly below `target` together with
        /// its successor. The sentinel bounds the walk from above.
        fn locate(&self, start: u32, target: u32) -> (u32, u32) {
            let mut lower = start;
            let mut node = self.buckets.get(lower).unwrap_or_default();
            while node.next < target {
                lower = node.next;
                node = self.buckets.get(lower).unwrap_or_default();
            }
            (lower, node.next)
        }

        /// Link a fresh node carrying its first bid between two neighbors.
        fn splice_in(&mut self, lower: u32, target: u32, upper: u32) {
            let mut low = self.buckets.get(lower).unwrap_or_default();
            low.next = target;
            self.buckets.insert(lower, &low);

            let mut up = self.buckets.get(upper).unwrap_or_default();
            up.prev = target;
            self.buckets.insert(upper, &up);

            self.buckets.insert(
                target,
                &Bucket {
                    prev: lower,
                    next: upper,
                    bid_count: 1,
                },
            );
        }

        /// Drop one bid from a node; an emptied non-endpoint node is
        /// unlinked and removed.
        fn release_bucket(&mut self, index: u32) {
            let tail = self.bucket_count - 1;
            let mut node = self.buckets.get(index).unwrap_or_default();
            node.bid_count = node.bid_count.saturating_sub(1);

            if node.bid_count == 0 && index != 0 && index != tail {
                let mut prev = self.buckets.get(node.prev).unwrap_or_default();
                prev.next = node.next;
                self.buckets.insert(node.prev, &prev);

                let mut next = self.buckets.get(node.next).unwrap_or_default();
                next.prev = node.prev;
                self.buckets.insert(node.next, &next);

                self.buckets.remove(index);
            } else {
                self.buckets.insert(index, &node);
            }
        }

        // =====================================================================
        // INTERNAL — phase schedule & redemption maths
        // =====================================================================

        /// Bonus rate earned by a bid submitted at `now`: flat maximum
        /// through the full-bonus phase, then linear decay to zero at
        /// `end_time`.
        fn bonus_rate_at(&self, now: Timestamp) -> u64 {
            if now < self.end_full_bonus_time {
                return self.max_bonus_rate;
            }
            if now >= self.end_time {
                return 0;
            }
            let remaining = (self.end_time - now) as u128;
            let window = (self.end_time - self.end_full_bonus_time) as u128;
            (self.max_bonus_rate as u128 * remaining / window) as u64
        }

        /// Contribution inflated by the earned bonus — the bid's weight in
        /// the pro-rata token split.
        fn virtual_contribution(contribution: Balance, bonus_rate: u64) -> Result<Balance, Error> {
            let bonus = contribution
                .checked_mul(bonus_rate as Balance)
                .ok_or(Error::Overflow)?
                / BONUS_RATE_DIVISOR as Balance;
            contribution.checked_add(bonus).ok_or(Error::Overflow)
        }

        /// Token entitlement of a bid that closed active. The quotient
        /// never exceeds `tokens_for_sale`: the bid's weighted contribution
        /// is a summand of the divisor.
        fn redeemable_tokens(&self, bid: &Bid) -> Result<Balance, Error> {
            if self.sum_accepted_virtual_contrib == 0 {
                return Ok(0);
            }
            let weighted = Self::virtual_contribution(bid.contribution, bid.bonus_rate)?;
            let share = U256::from(self.tokens_for_sale) * U256::from(weighted)
                / U256::from(self.sum_accepted_virtual_contrib);
            Balance::try_from(share).map_err(|_| Error::Overflow)
        }

        // =====================================================================
        // INTERNAL — token collaborator calls
        // =====================================================================

        fn token_balance_of(&self, token: AccountId, owner: AccountId) -> Result<Balance, Error> {
            let result = build_call::<DefaultEnvironment>()
                .call(token)
                .exec_input(
                    ExecutionInput::new(Selector::new(ink::selector_bytes!("balance_of")))
                        .push_arg(owner),
                )
                .returns::<Balance>()
                .try_invoke();

            match result {
                Ok(Ok(balance)) => Ok(balance),
                _ => Err(Error::TokenCallFailed),
            }
        }

        fn token_transfer(
            &self,
            token: AccountId,
            to: AccountId,
            amount: Balance,
        ) -> Result<(), Error> {
            let result = build_call::<DefaultEnvironment>()
                .call(token)
                .exec_input(
                    ExecutionInput::new(Selector::new(ink::selector_bytes!("transfer")))
                        .push_arg(to)
                        .push_arg(amount),
                )
                .returns::<Result<(), Error>>()
                .try_invoke();

            match result {
                Ok(Ok(Ok(()))) => Ok(()),
                _ => Err(Error::TokenCallFailed),
            }
        }

        /// The off-chain engine cannot execute cross-contract calls, so the
        /// unit tests configure the collaborator directly.
        #[cfg(test)]
        fn configure_token_for_tests(&mut self, token: AccountId, tokens_for_sale: Balance) {
            self.token = Some(token);
            self.tokens_for_sale = tokens_for_sale;
        }

        // =====================================================================
        // VIEW FUNCTIONS
        // =====================================================================

        #[ink(message)]
        pub fn owner(&self) -> AccountId {
            self.owner
        }

        #[ink(message)]
        pub fn beneficiary(&self) -> AccountId {
            self.beneficiary
        }

        #[ink(message)]
        pub fn token(&self) -> Option<AccountId> {
            self.token
        }

        #[ink(message)]
        pub fn tokens_for_sale(&self) -> Balance {
            self.tokens_for_sale
        }

        #[ink(message)]
        pub fn start_time(&self) -> Timestamp {
            self.start_time
        }

        #[ink(message)]
        pub fn end_full_bonus_time(&self) -> Timestamp {
            self.end_full_bonus_time
        }

        #[ink(message)]
        pub fn withdrawal_lock_time(&self) -> Timestamp {
            self.withdrawal_lock_time
        }

        #[ink(message)]
        pub fn end_time(&self) -> Timestamp {
            self.end_time
        }

        #[ink(message)]
        pub fn max_bonus_rate(&self) -> u64 {
            self.max_bonus_rate
        }

        #[ink(message)]
        pub fn min_valuation(&self) -> Balance {
            self.min_valuation
        }

        #[ink(message)]
        pub fn max_valuation(&self) -> Balance {
            self.max_valuation
        }

        #[ink(message)]
        pub fn bucket_increment(&self) -> Balance {
            self.bucket_increment
        }

        #[ink(message)]
        pub fn bucket_count(&self) -> u32 {
            self.bucket_count
        }

        #[ink(message)]
        pub fn last_bid_id(&self) -> u64 {
            self.last_bid_id
        }

        #[ink(message)]
        pub fn sum_accepted_contrib(&self) -> Balance {
            self.sum_accepted_contrib
        }

        #[ink(message)]
        pub fn sum_accepted_virtual_contrib(&self) -> Balance {
            self.sum_accepted_virtual_contrib
        }

        #[ink(message)]
        pub fn forfeited_funds(&self) -> Balance {
            self.forfeited_funds
        }

        #[ink(message)]
        pub fn finalized(&self) -> bool {
            self.finalized
        }

        #[ink(message)]
        pub fn bid(&self, bid_id: u64) -> Option<Bid> {
            self.bids.get(bid_id)
        }

        #[ink(message)]
        pub fn bucket(&self, index: u32) -> Option<Bucket> {
            self.buckets.get(index)
        }

        /// Valuation level represented by a bucket index.
        #[ink(message)]
        pub fn bucket_value(&self, index: u32) -> Balance {
            self.min_valuation
                .saturating_add(self.bucket_increment.saturating_mul(index as Balance))
        }

        /// Bonus rate a bid submitted right now would earn.
        #[ink(message)]
        pub fn current_bonus_rate(&self) -> u64 {
            self.bonus_rate_at(self.env().block_timestamp())
        }
    }

    // =========================================================================
    // UNIT TESTS
    // =========================================================================

}
