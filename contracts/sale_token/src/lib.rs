#![cfg_attr(not(feature = "std"), no_std, no_main)]

/// # Sale Token
///
/// **Role:** the fungible token disbursed by the interactive sale. The sale
/// contract holds the for-sale supply (minted to it before the token is
/// wired up), reads its own balance once at configuration time, and calls
/// `transfer` per redemption. Minting is owner-gated; everything else is a
/// plain allowance-based token ledger.
#[ink::contract]
mod sale_token {
    use ink::storage::Mapping;

    // =========================================================================
    // STORAGE
    // =========================================================================

    #[ink(storage)]
    pub struct SaleToken {
        owner: AccountId,
        total_supply: Balance,
        balances: Mapping<AccountId, Balance>,
        allowances: Mapping<(AccountId, AccountId), Balance>,
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    #[ink(event)]
    pub struct Transfer {
        #[ink(topic)]
        from: Option<AccountId>,
        #[ink(topic)]
        to: Option<AccountId>,
        value: Balance,
    }

    #[ink(event)]
    pub struct Approval {
        #[ink(topic)]
        owner: AccountId,
        #[ink(topic)]
        spender: AccountId,
        value: Balance,
    }

    // =========================================================================
    // ERRORS
    // =========================================================================

    #[derive(Debug, PartialEq, Eq, scale::Encode, scale::Decode)]
    #[cfg_attr(feature = "std", derive(scale_info::TypeInfo))]
    pub enum Error {
        /// Caller is not the contract owner.
        NotOwner,
        /// Sender's balance is insufficient.
        InsufficientBalance,
        /// Spender's allowance is insufficient.
        InsufficientAllowance,
        /// An arithmetic operation overflowed.
        Overflow,
    }

    // =========================================================================
    // IMPLEMENTATION
    // =========================================================================

    impl SaleToken {
        /// Deploy with an empty supply; the owner mints afterwards.
        #[ink(constructor)]
        pub fn new() -> Self {
            Self {
                owner: Self::env().caller(),
                total_supply: 0,
                balances: Mapping::default(),
                allowances: Mapping::default(),
            }
        }

        // =================================================================
        // SUPPLY
        // =================================================================

        /// Mint fresh tokens to an account. Owner only.
        #[ink(message)]
        pub fn mint(&mut self, to: AccountId, amount: Balance) -> Result<(), Error> {
            self.ensure_owner()?;

            let balance = self.balances.get(to).unwrap_or(0);
            let updated = balance.checked_add(amount).ok_or(Error::Overflow)?;
            self.total_supply = self
                .total_supply
                .checked_add(amount)
                .ok_or(Error::Overflow)?;
            self.balances.insert(to, &updated);

            self.env().emit_event(Transfer {
                from: None,
                to: Some(to),
                value: amount,
            });
            Ok(())
        }

        // =================================================================
        // TRANSFERS
        // =================================================================

        #[ink(message)]
        pub fn transfer(&mut self, to: AccountId, amount: Balance) -> Result<(), Error> {
            let from = self.env().caller();
            self.move_balance(from, to, amount)
        }

        #[ink(message)]
        pub fn approve(&mut self, spender: AccountId, amount: Balance) -> Result<(), Error> {
            let owner = self.env().caller();
            self.allowances.insert((owner, spender), &amount);

            self.env().emit_event(Approval {
                owner,
                spender,
                value: amount,
            });
            Ok(())
        }

        #[ink(message)]
        pub fn transfer_from(
            &mut self,
            from: AccountId,
            to: AccountId,
            amount: Balance,
        ) -> Result<(), Error> {
            let spender = self.env().caller();
            let allowance = self.allowances.get((from, spender)).unwrap_or(0);
            if allowance < amount {
                return Err(Error::InsufficientAllowance);
            }

            self.move_balance(from, to, amount)?;
            self.allowances.insert((from, spender), &(allowance - amount));
            Ok(())
        }

        fn move_balance(
            &mut self,
            from: AccountId,
            to: AccountId,
            amount: Balance,
        ) -> Result<(), Error> {
            let from_balance = self.balances.get(from).unwrap_or(0);
            if from_balance < amount {
                return Err(Error::InsufficientBalance);
            }
            let to_balance = self.balances.get(to).unwrap_or(0);
            let credited = to_balance.checked_add(amount).ok_or(Error::Overflow)?;

            self.balances.insert(from, &(from_balance - amount));
            self.balances.insert(to, &credited);

            self.env().emit_event(Transfer {
                from: Some(from),
                to: Some(to),
                value: amount,
            });
            Ok(())
        }

        fn ensure_owner(&self) -> Result<(), Error> {
            if self.env().caller() != self.owner {
                return Err(Error::NotOwner);
            }
            Ok(())
        }

        // =================================================================
        // VIEW FUNCTIONS
        // =================================================================

        #[ink(message)]
        pub fn total_supply(&self) -> Balance {
            self.total_supply
        }

        #[ink(message)]
        pub fn balance_of(&self, account: AccountId) -> Balance {
            self.balances.get(account).unwrap_or(0)
        }

        #[ink(message)]
        pub fn allowance(&self, owner: AccountId, spender: AccountId) -> Balance {
            self.allowances.get((owner, spender)).unwrap_or(0)
        }

        #[ink(message)]
        pub fn owner(&self) -> AccountId {
            self.owner
        }
    }

    impl Default for SaleToken {
        fn default() -> Self {
            Self::new()
        }
    }

    // =========================================================================
    // UNIT TESTS
    // =========================================================================

}
