use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::{AppError, Bank, Envelope, LoanApplication, NewAccount};
use crate::config::Policy;
use crate::domain::{
    format_cents, parse_cents, Account, AccountStatus, AccountType, Action, Cents, KycStatus,
    Loan, LoanStatus, LoanType, PermissionId, Transaction, TransferRail,
};

/// Khata - banking back-office ledger
#[derive(Parser)]
#[command(name = "khata")]
#[command(about = "Accounts, transfers, loans and role-based permissions over a SQLite ledger")]
#[command(version)]
pub struct Cli {
    /// Database file path
    #[arg(short, long, env = "KHATA_DATABASE", default_value = "khata.db")]
    pub database: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print the `{ success, data, message }` envelope as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Act as this user; the command is refused unless their role allows it
    #[arg(short, long, global = true, env = "KHATA_USER")]
    pub user: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database and seed the built-in roles
    Init,

    /// Branch management commands
    #[command(subcommand)]
    Branch(BranchCommands),

    /// Customer and KYC commands
    #[command(subcommand)]
    Customer(CustomerCommands),

    /// Account management commands
    #[command(subcommand)]
    Account(AccountCommands),

    /// Deposit into an account
    Deposit {
        /// Account number
        account: String,

        /// Amount (e.g., "500.00" or "500")
        amount: String,

        #[arg(short, long)]
        description: Option<String>,
    },

    /// Withdraw from an account
    Withdraw {
        /// Account number
        account: String,

        /// Amount (e.g., "500.00" or "500")
        amount: String,

        #[arg(short, long)]
        description: Option<String>,
    },

    /// Transfer between two accounts
    Transfer {
        /// Amount to transfer
        amount: String,

        /// Source account number
        #[arg(long)]
        from: String,

        /// Destination account number
        #[arg(long)]
        to: String,

        /// Rail: transfer (internal), neft, rtgs, imps, upi
        #[arg(long, default_value = "transfer")]
        rail: String,

        #[arg(short, long)]
        description: Option<String>,
    },

    /// Pay a UPI id from an account
    Upi {
        /// Amount to pay
        amount: String,

        /// Source account number
        #[arg(long)]
        from: String,

        /// Payee UPI id (name@bank)
        #[arg(long)]
        to: String,

        #[arg(short, long)]
        description: Option<String>,
    },

    /// Reverse a transaction
    Reverse {
        /// Transaction ID to reverse
        id: String,

        /// Reason recorded on the reversal
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Show detailed transaction information
    Show {
        /// Transaction ID
        id: String,
    },

    /// Quote the charges for a transfer
    Quote {
        amount: String,

        #[arg(long, default_value = "neft")]
        rail: String,
    },

    /// Loan commands
    #[command(subcommand)]
    Loan(LoanCommands),

    /// Scheduled job commands
    #[command(subcommand)]
    Jobs(JobCommands),

    /// Roles, permissions and users
    #[command(subcommand)]
    Rbac(RbacCommands),

    /// Verify ledger integrity
    Check,

    /// Export data to CSV or JSON
    Export {
        /// What to export: statement, accounts, full
        #[arg(value_name = "TYPE")]
        export_type: String,

        /// Account number (for statement)
        #[arg(long)]
        account: Option<String>,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum BranchCommands {
    /// Create a branch
    Create {
        name: String,

        /// 11-character IFSC code, e.g. KHAT0000001
        #[arg(long)]
        ifsc: String,
    },

    /// List branches
    List,
}

#[derive(Subcommand)]
pub enum CustomerCommands {
    /// Register a customer (KYC starts pending)
    Create {
        name: String,

        #[arg(long)]
        email: Option<String>,
    },

    /// Set KYC status: pending, verified, rejected
    Kyc { id: String, status: String },

    /// Show a customer and their accounts
    Show { id: String },

    /// List customers
    List,
}

#[derive(Subcommand)]
pub enum AccountCommands {
    /// Open an account for a KYC-verified customer
    Open {
        /// Customer ID
        #[arg(long)]
        customer: String,

        /// Branch IFSC code
        #[arg(long)]
        branch: String,

        /// savings, current, fixed_deposit, recurring_deposit
        #[arg(short = 't', long = "type", default_value = "savings")]
        account_type: String,

        /// Opening deposit
        #[arg(long)]
        deposit: Option<String>,

        /// Override the type's default minimum balance
        #[arg(long)]
        minimum_balance: Option<String>,
    },

    /// Show account details
    Show { number: String },

    /// List accounts
    List {
        /// Only this customer's accounts
        #[arg(long)]
        customer: Option<String>,
    },

    /// Freeze an account
    Freeze { number: String },

    /// Reactivate a frozen or dormant account
    Unfreeze { number: String },

    /// Mark an account dormant
    Dormant { number: String },

    /// Close a zero-balance account
    Close { number: String },

    /// Link a UPI id to an account
    SetUpi { number: String, upi_id: String },

    /// Show recent transactions
    Statement {
        number: String,

        #[arg(short, long)]
        limit: Option<usize>,
    },
}

#[derive(Subcommand)]
pub enum LoanCommands {
    /// Apply for a loan
    Apply {
        /// Customer ID
        #[arg(long)]
        customer: String,

        /// Account the loan is disbursed into and repaid from
        #[arg(long)]
        account: String,

        /// personal, home, vehicle, education, business, gold
        #[arg(short = 't', long = "type", default_value = "personal")]
        loan_type: String,

        /// Principal amount
        #[arg(long)]
        principal: String,

        /// Annual interest rate in percent
        #[arg(long)]
        rate: f64,

        /// Tenure in months
        #[arg(long)]
        tenure: u32,

        #[arg(long)]
        purpose: Option<String>,
    },

    /// Move a submitted loan under review
    Review { number: String },

    /// Approve a loan, optionally for a different amount
    Approve {
        number: String,

        #[arg(long)]
        sanctioned: Option<String>,
    },

    /// Reject a loan
    Reject {
        number: String,

        #[arg(short, long)]
        reason: String,
    },

    /// Disburse an approved loan into its account
    Disburse { number: String },

    /// Repay towards a loan from its account
    Repay { number: String, amount: String },

    /// Settle an active loan early
    Foreclose { number: String },

    /// Show loan details
    Show { number: String },

    /// List loans
    List {
        #[arg(long)]
        status: Option<String>,
    },

    /// Flag loans whose EMI date has passed
    MarkOverdue,
}

#[derive(Subcommand)]
pub enum JobCommands {
    /// Run every job that is due now
    Run,

    /// List scheduled jobs
    List {
        /// Only jobs for this loan number
        #[arg(long)]
        subject: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum RbacCommands {
    /// Permission commands
    #[command(subcommand)]
    Permission(PermissionCommands),

    /// Role commands
    #[command(subcommand)]
    Role(RoleCommands),

    /// User commands
    #[command(subcommand)]
    User(UserCommands),

    /// Check whether a user may perform an action
    Check {
        username: String,
        resource: String,
        action: String,
    },
}

#[derive(Subcommand)]
pub enum PermissionCommands {
    Create {
        resource: String,
        action: String,

        #[arg(short, long)]
        description: Option<String>,
    },
    List,
}

#[derive(Subcommand)]
pub enum RoleCommands {
    Create {
        name: String,

        #[arg(long)]
        display_name: Option<String>,

        #[arg(long, default_value = "0")]
        priority: i64,

        /// Permission IDs to grant
        #[arg(long = "permission")]
        permissions: Vec<String>,
    },
    Show {
        name: String,
    },
    List,
    Grant {
        role: String,
        permission: String,
    },
    Revoke {
        role: String,
        permission: String,
    },
    Activate {
        name: String,
    },
    Deactivate {
        name: String,
    },
    Delete {
        name: String,
    },
}

#[derive(Subcommand)]
pub enum UserCommands {
    Create {
        username: String,

        #[arg(long)]
        role: Option<String>,
    },
    /// Assign a role, or remove it when --role is omitted
    Assign {
        username: String,

        #[arg(long)]
        role: Option<String>,
    },
    Show {
        username: String,
    },
}

impl Commands {
    /// The (resource, action) a user needs for this command.
    fn required_permission(&self) -> Option<(&'static str, Action)> {
        let required = match self {
            Commands::Init | Commands::Quote { .. } => return None,
            Commands::Branch(BranchCommands::Create { .. }) => ("branches", Action::Create),
            Commands::Branch(BranchCommands::List) => ("branches", Action::Read),
            Commands::Customer(CustomerCommands::Create { .. }) => ("customers", Action::Create),
            Commands::Customer(CustomerCommands::Kyc { .. }) => ("customers", Action::Update),
            Commands::Customer(_) => ("customers", Action::Read),
            Commands::Account(cmd) => match cmd {
                AccountCommands::Open { .. } => ("accounts", Action::Create),
                AccountCommands::Close { .. } => ("accounts", Action::Delete),
                AccountCommands::Freeze { .. }
                | AccountCommands::Unfreeze { .. }
                | AccountCommands::Dormant { .. }
                | AccountCommands::SetUpi { .. } => ("accounts", Action::Update),
                AccountCommands::Show { .. }
                | AccountCommands::List { .. }
                | AccountCommands::Statement { .. } => ("accounts", Action::Read),
            },
            Commands::Deposit { .. }
            | Commands::Withdraw { .. }
            | Commands::Transfer { .. }
            | Commands::Upi { .. } => ("transactions", Action::Create),
            Commands::Reverse { .. } => ("transactions", Action::Update),
            Commands::Show { .. } | Commands::Check => ("transactions", Action::Read),
            Commands::Loan(cmd) => match cmd {
                LoanCommands::Apply { .. } => ("loans", Action::Create),
                LoanCommands::Approve { .. } | LoanCommands::Reject { .. } => {
                    ("loans", Action::Approve)
                }
                LoanCommands::Disburse { .. } => ("loans", Action::Disburse),
                LoanCommands::Show { .. } | LoanCommands::List { .. } => ("loans", Action::Read),
                LoanCommands::Review { .. }
                | LoanCommands::Repay { .. }
                | LoanCommands::Foreclose { .. }
                | LoanCommands::MarkOverdue => ("loans", Action::Update),
            },
            Commands::Jobs(JobCommands::Run) => ("loans", Action::Update),
            Commands::Jobs(JobCommands::List { .. }) => ("loans", Action::Read),
            Commands::Rbac(cmd) => match cmd {
                RbacCommands::Permission(PermissionCommands::Create { .. }) => {
                    ("roles", Action::Create)
                }
                RbacCommands::Role(RoleCommands::Create { .. }) => ("roles", Action::Create),
                RbacCommands::Role(RoleCommands::Delete { .. }) => ("roles", Action::Delete),
                RbacCommands::Role(
                    RoleCommands::Grant { .. }
                    | RoleCommands::Revoke { .. }
                    | RoleCommands::Activate { .. }
                    | RoleCommands::Deactivate { .. },
                ) => ("roles", Action::Update),
                RbacCommands::Permission(PermissionCommands::List)
                | RbacCommands::Role(_)
                | RbacCommands::Check { .. } => ("roles", Action::Read),
                RbacCommands::User(UserCommands::Create { .. }) => ("users", Action::Create),
                RbacCommands::User(UserCommands::Assign { .. }) => ("users", Action::Update),
                RbacCommands::User(UserCommands::Show { .. }) => ("users", Action::Read),
            },
            Commands::Export { .. } => ("accounts", Action::Read),
        };
        Some(required)
    }
}

/// Prints either human-readable text or the JSON envelope.
#[derive(Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    fn emit<T: Serialize>(&self, data: &T, message: &str, human: impl FnOnce()) -> Result<()> {
        if self.json {
            let envelope = Envelope::ok(data).with_message(message);
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        } else {
            human();
        }
        Ok(())
    }
}

impl Cli {
    async fn auto_run_jobs(&self, bank: &Bank) {
        match bank.loans.run_due_jobs(Utc::now()).await {
            Ok(run) if run.completed + run.failed > 0 => {
                debug!(completed = run.completed, failed = run.failed, "ran due jobs");
                if self.verbose && !self.json {
                    eprintln!(
                        "[Auto-exec] Ran {} scheduled job(s), {} failed",
                        run.completed, run.failed
                    );
                }
            }
            Ok(_) => {}
            Err(e) => warn!("could not run due jobs: {e}"),
        }
    }

    pub async fn run(self) -> Result<()> {
        let json = self.json;
        let result = self.execute().await;

        if let Err(err) = &result {
            if json {
                let envelope = match err.downcast_ref::<AppError>() {
                    Some(app_err) => Envelope::error(app_err),
                    None => Envelope::failure(format!("{:#}", err), 400),
                };
                println!("{}", serde_json::to_string_pretty(&envelope)?);
            }
        }
        result
    }

    /// `init` creates the database. Every other command opens an existing
    /// one, runs due jobs and checks `--user` against the command's permission.
    async fn open_bank(&self, policy: Policy) -> Result<Bank> {
        if let Commands::Init = self.command {
            return Ok(Bank::init(&self.database, policy).await?);
        }

        let bank = Bank::connect(&self.database, policy).await?;
        self.auto_run_jobs(&bank).await;

        if let Some(username) = &self.user {
            if let Some((resource, action)) = self.command.required_permission() {
                bank.access.authorize(username, resource, action).await?;
            }
        }
        Ok(bank)
    }

    async fn execute(self) -> Result<()> {
        let out = Output { json: self.json };
        let bank = self.open_bank(Policy::from_env()).await?;

        match self.command {
            Commands::Init => {
                let roles = bank.access.list_roles().await?;
                out.emit(&roles, "Database initialized", || {
                    println!("Database initialized: {}", self.database);
                    println!(
                        "Roles: {}",
                        roles.iter().map(|r| r.name.as_str()).collect::<Vec<_>>().join(", ")
                    );
                })?;
            }
            Commands::Branch(cmd) => run_branch_command(&bank, out, cmd).await?,
            Commands::Customer(cmd) => run_customer_command(&bank, out, cmd).await?,
            Commands::Account(cmd) => run_account_command(&bank, out, cmd).await?,

            Commands::Deposit {
                account,
                amount,
                description,
            } => {
                let txn = bank
                    .ledger
                    .deposit(&account, parse_amount(&amount)?, description)
                    .await?;
                out.emit(&txn, "Deposit successful", || {
                    println!(
                        "Deposited {} into {} (balance {})",
                        format_cents(txn.amount),
                        account,
                        txn.balance_after.map(format_cents).unwrap_or_default()
                    );
                    println!("Transaction: {}", txn.id);
                })?;
            }

            Commands::Withdraw {
                account,
                amount,
                description,
            } => {
                let txn = bank
                    .ledger
                    .withdraw(&account, parse_amount(&amount)?, description)
                    .await?;
                out.emit(&txn, "Withdrawal successful", || {
                    println!(
                        "Withdrew {} from {} (balance {})",
                        format_cents(txn.amount),
                        account,
                        txn.balance_after.map(format_cents).unwrap_or_default()
                    );
                    println!("Transaction: {}", txn.id);
                })?;
            }

            Commands::Transfer {
                amount,
                from,
                to,
                rail,
                description,
            } => {
                let rail = parse_rail(&rail)?;
                let result = bank
                    .ledger
                    .transfer(&from, &to, parse_amount(&amount)?, rail, description)
                    .await?;
                out.emit(&result, "Transfer successful", || {
                    print_transfer(&result.transaction);
                    println!("  Balance {}: {}", from, format_cents(result.from_balance));
                })?;
            }

            Commands::Upi {
                amount,
                from,
                to,
                description,
            } => {
                let result = bank
                    .ledger
                    .upi_transfer(&from, &to, parse_amount(&amount)?, description)
                    .await?;
                out.emit(&result, "UPI payment successful", || {
                    print_transfer(&result.transaction);
                })?;
            }

            Commands::Reverse { id, reason } => {
                let id = parse_uuid(&id, "transaction")?;
                let result = bank.ledger.reverse_transaction(id, reason).await?;
                out.emit(&result, "Transaction reversed", || {
                    println!(
                        "Reversed {} {} ({})",
                        result.original.transaction_type,
                        format_cents(result.original.amount),
                        result.original.id
                    );
                    println!("Created reversal: {}", result.reversal.id);
                })?;
            }

            Commands::Show { id } => {
                let id = parse_uuid(&id, "transaction")?;
                let txn = bank.ledger.get_transaction(id).await?;
                let reversal = bank.ledger.get_reversal_of(id).await?;
                out.emit(&txn, "Transaction found", || {
                    print_transaction_details(&txn, reversal.as_ref())
                })?;
            }

            Commands::Quote { amount, rail } => {
                let quote = bank
                    .ledger
                    .quote_transfer(parse_rail(&rail)?, parse_amount(&amount)?)?;
                out.emit(&quote, "Quote", || {
                    println!("Rail:        {}", quote.rail);
                    println!("Amount:      {}", format_cents(quote.amount));
                    println!("Charges:     {}", format_cents(quote.charges));
                    println!("GST:         {}", format_cents(quote.gst));
                    println!("Total debit: {}", format_cents(quote.total_debit));
                })?;
            }

            Commands::Loan(cmd) => run_loan_command(&bank, out, cmd).await?,
            Commands::Jobs(cmd) => run_job_command(&bank, out, cmd).await?,
            Commands::Rbac(cmd) => run_rbac_command(&bank, out, cmd).await?,
            Commands::Check => run_check_command(&bank, out).await?,

            Commands::Export {
                export_type,
                account,
                output,
            } => run_export_command(&bank, &export_type, account.as_deref(), output.as_deref())
                .await?,
        }

        Ok(())
    }
}

async fn run_branch_command(bank: &Bank, out: Output, cmd: BranchCommands) -> Result<()> {
    match cmd {
        BranchCommands::Create { name, ifsc } => {
            let branch = bank.ledger.create_branch(&name, &ifsc).await?;
            out.emit(&branch, "Branch created", || {
                println!("Created branch: {} ({})", branch.name, branch.ifsc)
            })?;
        }

        BranchCommands::List => {
            let branches = bank.ledger.list_branches().await?;
            out.emit(&branches, "Branches", || {
                if branches.is_empty() {
                    println!("No branches found.");
                } else {
                    println!("{:<13} {}", "IFSC", "NAME");
                    println!("{}", "-".repeat(40));
                    for branch in &branches {
                        println!("{:<13} {}", branch.ifsc, branch.name);
                    }
                }
            })?;
        }
    }
    Ok(())
}

async fn run_customer_command(bank: &Bank, out: Output, cmd: CustomerCommands) -> Result<()> {
    match cmd {
        CustomerCommands::Create { name, email } => {
            let customer = bank.ledger.create_customer(&name, email).await?;
            out.emit(&customer, "Customer created", || {
                println!("Created customer: {} ({})", customer.full_name, customer.id);
                println!("KYC status: {}", customer.kyc_status);
            })?;
        }

        CustomerCommands::Kyc { id, status } => {
            let status: KycStatus = status.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            let customer = bank
                .ledger
                .set_kyc_status(parse_uuid(&id, "customer")?, status)
                .await?;
            out.emit(&customer, "KYC status updated", || {
                println!("{}: KYC {}", customer.full_name, customer.kyc_status)
            })?;
        }

        CustomerCommands::Show { id } => {
            let id = parse_uuid(&id, "customer")?;
            let customer = bank.ledger.get_customer(id).await?;
            let accounts = bank.ledger.list_accounts(Some(id)).await?;
            out.emit(&customer, "Customer found", || {
                println!("Customer: {}", customer.full_name);
                println!("  ID:      {}", customer.id);
                if let Some(email) = &customer.email {
                    println!("  Email:   {}", email);
                }
                println!("  KYC:     {}", customer.kyc_status);
                println!(
                    "  Created: {}",
                    customer.created_at.format("%Y-%m-%d %H:%M:%S")
                );
                println!();
                print_accounts(&accounts);
            })?;
        }

        CustomerCommands::List => {
            let customers = bank.ledger.list_customers().await?;
            out.emit(&customers, "Customers", || {
                if customers.is_empty() {
                    println!("No customers found.");
                } else {
                    println!("{:<38} {:<24} {}", "ID", "NAME", "KYC");
                    println!("{}", "-".repeat(72));
                    for c in &customers {
                        println!("{:<38} {:<24} {}", c.id, truncate(&c.full_name, 24), c.kyc_status);
                    }
                }
            })?;
        }
    }
    Ok(())
}

async fn run_account_command(bank: &Bank, out: Output, cmd: AccountCommands) -> Result<()> {
    match cmd {
        AccountCommands::Open {
            customer,
            branch,
            account_type,
            deposit,
            minimum_balance,
        } => {
            let account_type: AccountType = account_type.parse().map_err(|e: String| {
                anyhow::anyhow!(
                    "{}. Valid types: savings, current, fixed_deposit, recurring_deposit",
                    e
                )
            })?;
            let request = NewAccount {
                customer_id: parse_uuid(&customer, "customer")?,
                branch_ifsc: branch,
                account_type,
                initial_deposit: deposit.map(|d| parse_amount(&d)).transpose()?.unwrap_or(0),
                minimum_balance: minimum_balance.map(|m| parse_amount(&m)).transpose()?,
            };
            let account = bank.ledger.open_account(request).await?;
            out.emit(&account, "Account opened", || {
                println!(
                    "Opened {} account {} (balance {})",
                    account.account_type,
                    account.account_number,
                    format_cents(account.balance)
                )
            })?;
        }

        AccountCommands::Show { number } => {
            let account = bank.ledger.get_account(&number).await?;
            out.emit(&account, "Account found", || print_account_details(&account))?;
        }

        AccountCommands::List { customer } => {
            let customer = customer.map(|c| parse_uuid(&c, "customer")).transpose()?;
            let accounts = bank.ledger.list_accounts(customer).await?;
            out.emit(&accounts, "Accounts", || print_accounts(&accounts))?;
        }

        AccountCommands::Freeze { number } => {
            set_status(bank, out, &number, AccountStatus::Frozen).await?
        }
        AccountCommands::Unfreeze { number } => {
            set_status(bank, out, &number, AccountStatus::Active).await?
        }
        AccountCommands::Dormant { number } => {
            set_status(bank, out, &number, AccountStatus::Dormant).await?
        }

        AccountCommands::Close { number } => {
            let account = bank.ledger.close_account(&number).await?;
            out.emit(&account, "Account closed", || {
                println!("Closed account {}", account.account_number)
            })?;
        }

        AccountCommands::SetUpi { number, upi_id } => {
            let account = bank.ledger.link_upi(&number, &upi_id).await?;
            out.emit(&account, "UPI id linked", || {
                println!(
                    "Linked {} to {}",
                    account.upi_id.as_deref().unwrap_or_default(),
                    account.account_number
                )
            })?;
        }

        AccountCommands::Statement { number, limit } => {
            let statement = bank.ledger.statement(&number, limit).await?;
            out.emit(&statement, "Statement", || {
                print_account_details(&statement.account);
                println!();
                print_transactions(&statement.transactions, &number);
            })?;
        }
    }
    Ok(())
}

async fn set_status(bank: &Bank, out: Output, number: &str, status: AccountStatus) -> Result<()> {
    let account = bank.ledger.set_account_status(number, status).await?;
    out.emit(&account, "Account status updated", || {
        println!("Account {} is now {}", account.account_number, account.status)
    })
}

async fn run_loan_command(bank: &Bank, out: Output, cmd: LoanCommands) -> Result<()> {
    match cmd {
        LoanCommands::Apply {
            customer,
            account,
            loan_type,
            principal,
            rate,
            tenure,
            purpose,
        } => {
            let loan_type: LoanType = loan_type.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            let application = LoanApplication {
                customer_id: parse_uuid(&customer, "customer")?,
                account_number: account,
                loan_type,
                principal: parse_amount(&principal)?,
                interest_rate: rate,
                tenure_months: tenure,
                purpose,
            };
            let loan = bank.loans.apply_loan(application).await?;
            out.emit(&loan, "Loan application submitted", || {
                println!("Loan {} submitted", loan.loan_number);
                println!("  EMI: {} x {} months", format_cents(loan.emi), loan.tenure_months);
            })?;
        }

        LoanCommands::Review { number } => {
            let loan = bank.loans.review_loan(&number).await?;
            out.emit(&loan, "Loan under review", || print_loan_status(&loan))?;
        }

        LoanCommands::Approve { number, sanctioned } => {
            let sanctioned = sanctioned.map(|s| parse_amount(&s)).transpose()?;
            let loan = bank.loans.approve_loan(&number, sanctioned).await?;
            out.emit(&loan, "Loan approved", || {
                print_loan_status(&loan);
                println!("  Sanctioned: {}", format_cents(loan.amount_to_disburse()));
                println!("  EMI:        {}", format_cents(loan.emi));
            })?;
        }

        LoanCommands::Reject { number, reason } => {
            let loan = bank.loans.reject_loan(&number, &reason).await?;
            out.emit(&loan, "Loan rejected", || print_loan_status(&loan))?;
        }

        LoanCommands::Disburse { number } => {
            let posting = bank.loans.disburse_loan(&number).await?;
            out.emit(&posting, "Loan disbursed", || {
                print_loan_status(&posting.loan);
                println!(
                    "  Paid {} into {}",
                    format_cents(posting.transaction.amount),
                    posting.loan.account_number
                );
            })?;
        }

        LoanCommands::Repay { number, amount } => {
            let result = bank.loans.repay_emi(&number, parse_amount(&amount)?).await?;
            out.emit(&result, "Repayment successful", || {
                print_loan_status(&result.loan);
                println!("  Interest:    {}", format_cents(result.split.interest));
                println!("  Principal:   {}", format_cents(result.split.principal));
                println!("  Outstanding: {}", format_cents(result.loan.outstanding));
            })?;
        }

        LoanCommands::Foreclose { number } => {
            let posting = bank.loans.foreclose(&number).await?;
            out.emit(&posting, "Loan foreclosed", || {
                print_loan_status(&posting.loan);
                println!("  Paid {}", format_cents(posting.transaction.amount));
            })?;
        }

        LoanCommands::Show { number } => {
            let loan = bank.loans.get_loan(&number).await?;
            out.emit(&loan, "Loan found", || print_loan_details(&loan))?;
        }

        LoanCommands::List { status } => {
            let status = status
                .map(|s| s.parse::<LoanStatus>())
                .transpose()
                .map_err(|e| anyhow::anyhow!(e))?;
            let loans = bank.loans.list_loans(status).await?;
            out.emit(&loans, "Loans", || print_loans(&loans))?;
        }

        LoanCommands::MarkOverdue => {
            let loans = bank.loans.mark_overdue(Utc::now()).await?;
            out.emit(&loans, "Overdue loans flagged", || {
                if loans.is_empty() {
                    println!("No loans are past due.");
                } else {
                    print_loans(&loans);
                }
            })?;
        }
    }
    Ok(())
}

async fn run_job_command(bank: &Bank, out: Output, cmd: JobCommands) -> Result<()> {
    match cmd {
        JobCommands::Run => {
            let run = bank.loans.run_due_jobs(Utc::now()).await?;
            out.emit(&run, "Jobs run", || {
                println!("Completed: {}  Failed: {}", run.completed, run.failed)
            })?;
        }

        JobCommands::List { subject } => {
            let jobs = bank.loans.list_jobs(subject.as_deref()).await?;
            out.emit(&jobs, "Jobs", || {
                if jobs.is_empty() {
                    println!("No scheduled jobs.");
                } else {
                    println!(
                        "{:<14} {:<14} {:<20} {:<8} {}",
                        "KIND", "SUBJECT", "RUN AT", "STATUS", "ATTEMPTS"
                    );
                    println!("{}", "-".repeat(68));
                    for job in &jobs {
                        println!(
                            "{:<14} {:<14} {:<20} {:<8} {}",
                            job.kind,
                            job.subject,
                            job.run_at.format("%Y-%m-%d %H:%M"),
                            job.status,
                            job.attempts
                        );
                        if let Some(err) = &job.last_error {
                            println!("    last error: {}", err);
                        }
                    }
                }
            })?;
        }
    }
    Ok(())
}

async fn run_rbac_command(bank: &Bank, out: Output, cmd: RbacCommands) -> Result<()> {
    match cmd {
        RbacCommands::Permission(PermissionCommands::Create {
            resource,
            action,
            description,
        }) => {
            let permission = bank
                .access
                .create_permission(&resource, parse_action(&action)?, description)
                .await?;
            out.emit(&permission, "Permission created", || {
                println!("Created permission {} ({})", permission, permission.id)
            })?;
        }

        RbacCommands::Permission(PermissionCommands::List) => {
            let permissions = bank.access.list_permissions().await?;
            out.emit(&permissions, "Permissions", || {
                for p in &permissions {
                    println!("{:<38} {}", p.id, p);
                }
            })?;
        }

        RbacCommands::Role(cmd) => run_role_command(bank, out, cmd).await?,

        RbacCommands::User(UserCommands::Create { username, role }) => {
            let user = bank.access.create_user(&username, role.as_deref()).await?;
            out.emit(&user, "User created", || {
                println!("Created user {} ({})", user.username, user.id)
            })?;
        }

        RbacCommands::User(UserCommands::Assign { username, role }) => {
            let user = bank.access.assign_role(&username, role.as_deref()).await?;
            out.emit(&user, "Role assigned", || match &role {
                Some(role) => println!("{} now has role {}", user.username, role),
                None => println!("{} no longer has a role", user.username),
            })?;
        }

        RbacCommands::User(UserCommands::Show { username }) => {
            let user = bank.access.get_user(&username).await?;
            out.emit(&user, "User found", || {
                println!("User: {}", user.username);
                println!("  ID:   {}", user.id);
                match user.role_id {
                    Some(role) => println!("  Role: {}", role),
                    None => println!("  Role: (none)"),
                }
            })?;
        }

        RbacCommands::Check {
            username,
            resource,
            action,
        } => {
            let user = bank.access.get_user(&username).await?;
            let allowed = bank
                .access
                .check_permission(user.id, &resource, parse_action(&action)?)
                .await?;
            out.emit(&allowed, "Permission checked", || {
                println!(
                    "{} {} {} {}",
                    username,
                    if allowed { "may" } else { "may not" },
                    action,
                    resource
                )
            })?;
        }
    }
    Ok(())
}

async fn run_role_command(bank: &Bank, out: Output, cmd: RoleCommands) -> Result<()> {
    match cmd {
        RoleCommands::Create {
            name,
            display_name,
            priority,
            permissions,
        } => {
            let ids = permissions
                .iter()
                .map(|p| parse_uuid(p, "permission"))
                .collect::<Result<Vec<PermissionId>>>()?;
            let display_name = display_name.unwrap_or_else(|| name.clone());
            let role = bank
                .access
                .create_role(&name, &display_name, priority, &ids)
                .await?;
            out.emit(&role, "Role created", || {
                println!("Created role {} with {} permission(s)", role.name, role.permissions.len())
            })?;
        }

        RoleCommands::Show { name } => {
            let details = bank.access.get_role(&name).await?;
            out.emit(&details, "Role found", || {
                let role = &details.role;
                println!("Role: {} ({})", role.name, role.display_name);
                println!("  Priority: {}", role.priority);
                println!("  System:   {}", if role.is_system { "yes" } else { "no" });
                println!("  Active:   {}", if role.is_active { "yes" } else { "no" });
                println!("  Permissions:");
                for p in &details.permissions {
                    println!("    - {}", p);
                }
            })?;
        }

        RoleCommands::List => {
            let roles = bank.access.list_roles().await?;
            out.emit(&roles, "Roles", || {
                println!("{:<20} {:<26} {:>8} {:<6} {}", "NAME", "DISPLAY", "PRIORITY", "SYSTEM", "ACTIVE");
                println!("{}", "-".repeat(70));
                for r in &roles {
                    println!(
                        "{:<20} {:<26} {:>8} {:<6} {}",
                        r.name,
                        truncate(&r.display_name, 26),
                        r.priority,
                        if r.is_system { "yes" } else { "no" },
                        if r.is_active { "yes" } else { "no" }
                    );
                }
            })?;
        }

        RoleCommands::Grant { role, permission } => {
            let updated = bank
                .access
                .grant_permission(&role, parse_uuid(&permission, "permission")?)
                .await?;
            out.emit(&updated, "Permission granted", || {
                println!("Granted {} to {}", permission, role)
            })?;
        }

        RoleCommands::Revoke { role, permission } => {
            let updated = bank
                .access
                .revoke_permission(&role, parse_uuid(&permission, "permission")?)
                .await?;
            out.emit(&updated, "Permission revoked", || {
                println!("Revoked {} from {}", permission, role)
            })?;
        }

        RoleCommands::Activate { name } => {
            let role = bank.access.set_role_active(&name, true).await?;
            out.emit(&role, "Role activated", || println!("Activated role {}", role.name))?;
        }

        RoleCommands::Deactivate { name } => {
            let role = bank.access.set_role_active(&name, false).await?;
            out.emit(&role, "Role deactivated", || {
                println!("Deactivated role {}", role.name)
            })?;
        }

        RoleCommands::Delete { name } => {
            bank.access.delete_role(&name).await?;
            out.emit(&name, "Role deleted", || println!("Deleted role {}", name))?;
        }
    }
    Ok(())
}

async fn run_check_command(bank: &Bank, out: Output) -> Result<()> {
    let report = bank.ledger.check_integrity().await?;

    out.emit(&report, "Integrity check complete", || {
        println!("Checking ledger integrity...\n");
        println!("Accounts:     {}", report.account_count);
        println!("Transactions: {}", report.transaction_count);
        println!();
        if report.is_ok() {
            println!("Ledger is consistent.");
        } else {
            println!("Issues found:");
            for issue in &report.issues {
                println!("  - {}", issue);
            }
        }
    })?;

    if !report.is_ok() {
        anyhow::bail!("Ledger integrity check failed");
    }
    Ok(())
}

async fn run_export_command(
    bank: &Bank,
    export_type: &str,
    account: Option<&str>,
    output: Option<&str>,
) -> Result<()> {
    use crate::io::Exporter;
    use std::fs::File;
    use std::io::{stdout, Write};

    let exporter = Exporter::new(bank);

    let writer: Box<dyn Write> = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path))?;
            Box::new(file)
        }
        None => Box::new(stdout()),
    };

    match export_type {
        "statement" => {
            let account =
                account.ok_or_else(|| anyhow::anyhow!("--account is required for a statement"))?;
            let count = exporter.export_statement_csv(account, writer).await?;
            if output.is_some() {
                eprintln!("Exported {} transaction(s)", count);
            }
        }
        "accounts" => {
            let count = exporter.export_accounts_csv(writer).await?;
            if output.is_some() {
                eprintln!("Exported {} account(s)", count);
            }
        }
        "full" => {
            let snapshot = exporter.export_full_json(writer).await?;
            if output.is_some() {
                eprintln!(
                    "Exported {} account(s), {} transaction(s), {} loan(s)",
                    snapshot.accounts.len(),
                    snapshot.transactions.len(),
                    snapshot.loans.len()
                );
            }
        }
        other => anyhow::bail!(
            "Unknown export type '{}'. Valid types: statement, accounts, full",
            other
        ),
    }

    Ok(())
}

// ========================
// Formatting helpers
// ========================

fn print_transfer(txn: &Transaction) {
    println!(
        "{} {} -> {} ({})",
        txn.transaction_type.as_str().to_uppercase(),
        format_cents(txn.amount),
        txn.to_account
            .as_ref()
            .map(|s| s.account_number.as_str())
            .unwrap_or("-"),
        txn.id
    );
    if txn.charges > 0 {
        println!(
            "  Charges {} + GST {} = total debit {}",
            format_cents(txn.charges),
            format_cents(txn.gst),
            format_cents(txn.total_debit)
        );
    }
    if let Some(reference) = &txn.reference_number {
        println!("  Reference: {}", reference);
    }
}

fn print_transaction_details(txn: &Transaction, reversal: Option<&Transaction>) {
    println!("Transaction: {}", txn.id);
    println!("  Sequence:    {}", txn.sequence);
    println!("  Type:        {}", txn.transaction_type);
    println!("  Status:      {}", txn.status);
    println!(
        "  Date:        {}",
        txn.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(reference) = &txn.reference_number {
        println!("  Reference:   {}", reference);
    }
    if let Some(from) = &txn.from_account {
        println!(
            "  From:        {} {} ({})",
            from.account_number, from.ifsc, from.holder_name
        );
    }
    if let Some(to) = &txn.to_account {
        println!(
            "  To:          {} {} ({})",
            to.account_number, to.ifsc, to.holder_name
        );
    }
    println!("  Amount:      {}", format_cents(txn.amount));
    if txn.charges > 0 || txn.gst > 0 {
        println!("  Charges:     {}", format_cents(txn.charges));
        println!("  GST:         {}", format_cents(txn.gst));
    }
    println!("  Total debit: {}", format_cents(txn.total_debit));
    if let Some(desc) = &txn.description {
        println!("  Description: {}", desc);
    }
    if let Some(original) = txn.reverses {
        println!();
        println!("  This is a reversal of: {}", original);
    }
    if let Some(reversal) = reversal {
        println!();
        println!(
            "  Reversed on {} by {}",
            reversal.created_at.format("%Y-%m-%d"),
            reversal.id
        );
    }
}

fn print_account_details(account: &Account) {
    println!("Account: {}", account.account_number);
    println!("  Type:            {}", account.account_type);
    println!("  Status:          {}", account.status);
    println!("  Customer:        {}", account.customer_id);
    println!("  Balance:         {}", format_cents(account.balance));
    println!("  Minimum balance: {}", format_cents(account.minimum_balance));
    println!("  Daily limit:     {}", format_limit(account.daily_limit));
    println!("  Monthly limit:   {}", format_limit(account.monthly_limit));
    if let Some(upi) = &account.upi_id {
        println!("  UPI id:          {}", upi);
    }
    println!(
        "  Opened:          {}",
        account.created_at.format("%Y-%m-%d %H:%M:%S")
    );
}

fn print_accounts(accounts: &[Account]) {
    if accounts.is_empty() {
        println!("No accounts found.");
        return;
    }
    println!(
        "{:<18} {:<18} {:<8} {:>16}",
        "NUMBER", "TYPE", "STATUS", "BALANCE"
    );
    println!("{}", "-".repeat(63));
    for a in accounts {
        println!(
            "{:<18} {:<18} {:<8} {:>16}",
            a.account_number,
            a.account_type,
            a.status,
            format_cents(a.balance)
        );
    }
}

fn print_transactions(transactions: &[Transaction], account_number: &str) {
    if transactions.is_empty() {
        println!("No transactions found.");
        return;
    }
    println!(
        "{:<17} {:<10} {:>14} {:>16}  {}",
        "DATE", "TYPE", "AMOUNT", "BALANCE", "DESCRIPTION"
    );
    println!("{}", "-".repeat(80));
    for txn in transactions {
        let delta = txn
            .legs()
            .into_iter()
            .filter(|(number, _)| *number == account_number)
            .map(|(_, delta)| delta)
            .sum::<Cents>();
        let balance = if txn
            .from_account
            .as_ref()
            .is_some_and(|s| s.account_number == account_number)
            || txn.from_account.is_none()
        {
            txn.balance_after.map(format_cents).unwrap_or_default()
        } else {
            String::new()
        };
        println!(
            "{:<17} {:<10} {:>14} {:>16}  {}",
            txn.created_at.format("%Y-%m-%d %H:%M"),
            txn.transaction_type,
            format_cents(delta),
            balance,
            truncate(txn.description.as_deref().unwrap_or(""), 30)
        );
    }
}

fn print_loan_status(loan: &Loan) {
    println!("Loan {}: {}", loan.loan_number, loan.status);
}

fn print_loan_details(loan: &Loan) {
    println!("Loan: {}", loan.loan_number);
    println!("  Type:            {}", loan.loan_type);
    println!("  Status:          {}", loan.status);
    println!("  Account:         {}", loan.account_number);
    println!("  Principal:       {}", format_cents(loan.principal));
    if let Some(sanctioned) = loan.sanctioned_amount {
        println!("  Sanctioned:      {}", format_cents(sanctioned));
    }
    println!("  Rate:            {}% p.a.", loan.interest_rate);
    println!("  Tenure:          {} months", loan.tenure_months);
    println!("  EMI:             {}", format_cents(loan.emi));
    println!("  Outstanding:     {}", format_cents(loan.outstanding));
    println!(
        "  EMIs:            {} paid, {} remaining",
        loan.emis_paid, loan.emis_remaining
    );
    if let Some(next) = loan.next_emi_date {
        println!("  Next EMI:        {}", next.format("%Y-%m-%d"));
    }
    if loan.overdue_days > 0 {
        println!(
            "  Overdue:         {} day(s), penalty {}",
            loan.overdue_days,
            format_cents(loan.penalty_amount)
        );
    }
    if let Some(reason) = &loan.rejection_reason {
        println!("  Rejected:        {}", reason);
    }
}

fn print_loans(loans: &[Loan]) {
    if loans.is_empty() {
        println!("No loans found.");
        return;
    }
    println!(
        "{:<14} {:<10} {:<12} {:>14} {:>12}",
        "NUMBER", "TYPE", "STATUS", "OUTSTANDING", "EMI"
    );
    println!("{}", "-".repeat(66));
    for loan in loans {
        println!(
            "{:<14} {:<10} {:<12} {:>14} {:>12}",
            loan.loan_number,
            loan.loan_type,
            loan.status,
            format_cents(loan.outstanding),
            format_cents(loan.emi)
        );
    }
}

fn format_limit(limit: Cents) -> String {
    if limit == 0 {
        "none".to_string()
    } else {
        format_cents(limit)
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len - 3).collect();
        format!("{}...", cut)
    }
}

fn parse_amount(amount: &str) -> Result<Cents> {
    parse_cents(amount).context("Invalid amount format. Use '500.00' or '500'")
}

fn parse_uuid(id: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(id).with_context(|| format!("Invalid {} ID format (expected UUID)", what))
}

fn parse_rail(rail: &str) -> Result<TransferRail> {
    rail.parse().map_err(|e: String| {
        anyhow::anyhow!("{}. Valid rails: transfer, neft, rtgs, imps, upi", e)
    })
}

fn parse_action(action: &str) -> Result<Action> {
    action.parse().map_err(|e: String| anyhow::anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_global_flags() {
        let cli = Cli::try_parse_from([
            "khata", "--json", "--user", "teller1", "deposit", "1000000000000001", "500",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.user.as_deref(), Some("teller1"));
        assert_eq!(
            cli.command.required_permission(),
            Some(("transactions", Action::Create))
        );
    }

    #[test]
    fn test_required_permissions() {
        let cli = Cli::try_parse_from(["khata", "loan", "disburse", "LN0000000001"]).unwrap();
        assert_eq!(
            cli.command.required_permission(),
            Some(("loans", Action::Disburse))
        );

        let cli = Cli::try_parse_from(["khata", "init"]).unwrap();
        assert_eq!(cli.command.required_permission(), None);
    }

    #[tokio::test]
    async fn test_init_then_connect() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("cli.db").to_string_lossy().into_owned();

        // Nothing to connect to before init
        let check = Cli::try_parse_from(["khata", "-d", path.as_str(), "check"]).unwrap();
        assert!(check.run().await.is_err());

        for _ in 0..2 {
            let init =
                Cli::try_parse_from(["khata", "-d", path.as_str(), "--json", "init"]).unwrap();
            init.run().await.unwrap();
        }

        let check = Cli::try_parse_from(["khata", "-d", path.as_str(), "check"]).unwrap();
        check.run().await.unwrap();

        let bank = Bank::connect(&path, Policy::default()).await.unwrap();
        assert!(bank.ledger.check_integrity().await.unwrap().is_ok());
        assert!(!bank.access.list_roles().await.unwrap().is_empty());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a much longer description", 10), "a much ...");
    }
}
