use clap::{Parser, Subcommand, ValueEnum};

#[allow(clippy::upper_case_acronyms)]
#[derive(Parser, Debug)]
#[clap(name = "rbulk", about, version)]
pub struct CLI {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Insert,
    Update,
    Delete,
    Merge,
    Synchronize,
}

#[derive(Parser, Debug)]
#[clap(about = "Chunked, set-based bulk writes for Postgres", long_about = None)]
pub enum Commands {
    /// Writes a JSON array of records to a table declared in rbulk.yaml.
    ///
    /// synchronize deletes every row whose merge key is not in the file
    /// (within --scope when given) and asks for confirmation first.
    ///
    /// Example:
    /// `rbulk execute --table customers --mode merge --records customers.json`
    #[clap(name = "execute")]
    Execute {
        #[clap(long, short)]
        table: String,

        #[clap(long, short, value_enum)]
        mode: Mode,

        /// Path to a JSON file holding an array of objects keyed by column name.
        #[clap(long, short)]
        records: String,

        /// optional - Overrides the table's declared merge key, repeat for composite keys.
        #[clap(long = "merge-key")]
        merge_key: Vec<String>,

        /// optional - Columns overwritten on a match, repeat for more than one.
        #[clap(long = "update-column")]
        update_columns: Vec<String>,

        /// optional - Only rows matching this predicate may be deleted by synchronize.
        #[clap(long)]
        scope: Option<String>,

        #[clap(long = "chunk-size")]
        chunk_size: Option<usize>,

        /// optional - Commit every statement on its own.
        #[clap(long = "no-transaction")]
        no_transaction: bool,

        /// optional - Run the whole batch in one transaction.
        #[clap(long = "batch-transaction", conflicts_with = "no_transaction")]
        batch_transaction: bool,

        /// optional - How many chunks to write at once.
        #[clap(long)]
        parallel: Option<usize>,

        /// optional - Write the records, generated keys included, to this file.
        #[clap(long, short)]
        output: Option<String>,

        /// Skip the confirmation prompt.
        #[clap(long, short)]
        yes: bool,

        /// optional - The path to run the command in, default will be where the command is run.
        #[clap(long, short)]
        path: Option<String>,
    },

    /// Updates every row matching a predicate in one statement.
    ///
    /// Example:
    /// `rbulk update-where --table users --where "is_active == true && visits < 3" --set is_active=false`
    #[clap(name = "update-where")]
    UpdateWhere {
        #[clap(long, short)]
        table: String,

        #[clap(long = "where", short)]
        predicate: String,

        /// `column=value`, `column+=value` or `column-=value`, repeat for more columns.
        #[clap(long, required = true)]
        set: Vec<String>,

        /// optional - The path to run the command in, default will be where the command is run.
        #[clap(long, short)]
        path: Option<String>,
    },

    /// Deletes every row matching a predicate in one statement.
    ///
    /// Example:
    /// `rbulk delete-where --table users --where "last_login < '2024-01-01T00:00:00Z'"`
    #[clap(name = "delete-where")]
    DeleteWhere {
        #[clap(long, short)]
        table: String,

        #[clap(long = "where", short)]
        predicate: String,

        /// Skip the confirmation prompt.
        #[clap(long, short)]
        yes: bool,

        /// optional - The path to run the command in, default will be where the command is run.
        #[clap(long, short)]
        path: Option<String>,
    },

    /// Prints, as JSON lines, the rows whose key is in a set of values.
    ///
    /// With more than one --column every value is a `:` separated tuple.
    ///
    /// Example:
    /// `rbulk where-in --table users --column code --values A-1,A-2 --order-by name`
    #[clap(name = "where-in")]
    WhereIn {
        #[clap(long, short)]
        table: String,

        #[clap(long, short, required = true)]
        column: Vec<String>,

        #[clap(long, short, value_delimiter = ',')]
        values: Vec<String>,

        #[clap(long = "order-by")]
        order_by: Option<String>,

        /// optional - The path to run the command in, default will be where the command is run.
        #[clap(long, short)]
        path: Option<String>,
    },
}
