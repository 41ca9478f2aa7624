use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::Amount;
use crate::batch::Command;
use crate::model::{CustomerId, OrderId, ParseEnumError, PayMethod, Product, ProductId, Wallet};

/// Errors that can occur when reading or writing csv files
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized command '{command}'")]
    UnrecognizedCommand { line: usize, command: String },

    #[error("line {line}: {command} missing {field}")]
    MissingField {
        line: usize,
        command: String,
        field: &'static str,
    },

    #[error("line {line}: {source}")]
    InvalidValue { line: usize, source: ParseEnumError },

    #[error("failed to write csv: {0}")]
    Write(#[from] csv::Error),

    #[error("failed to flush csv output: {0}")]
    Flush(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct CommandRow {
    r#type: String,
    customer: Option<CustomerId>,
    order: Option<OrderId>,
    amount: Option<f64>,
    product: Option<ProductId>,
    qty: Option<u32>,
    pay: Option<String>,
    discount: Option<f64>,
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProductRow {
    id: ProductId,
    name: String,
    price: f64,
    duration_min: Option<i32>,
    sellable: bool,
}

#[derive(Debug, Serialize)]
struct WalletRow {
    customer: CustomerId,
    balance: String,
    frozen: bool,
}

fn open(path: &Path) -> Result<csv::Reader<File>, CsvError> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })
}

/// Pull a required column out of a row
fn required<T>(value: Option<T>, line: usize, command: &str, field: &'static str) -> Result<T, CsvError> {
    value.ok_or_else(|| CsvError::MissingField {
        line,
        command: command.to_string(),
        field,
    })
}

impl CommandRow {
    fn into_command(self, line: usize) -> Result<Command, CsvError> {
        let command = self.r#type.as_str();
        match command {
            "recharge" => Ok(Command::Recharge {
                customer: required(self.customer, line, command, "customer")?,
                amount: Amount::from_float(required(self.amount, line, command, "amount")?),
                key: required(self.key, line, command, "key")?,
            }),
            "order" => {
                let pay = required(self.pay, line, command, "pay")?;
                let pay_method = pay
                    .parse::<PayMethod>()
                    .map_err(|source| CsvError::InvalidValue { line, source })?;
                Ok(Command::Order {
                    customer: required(self.customer, line, command, "customer")?,
                    product: required(self.product, line, command, "product")?,
                    qty: self.qty.unwrap_or(1),
                    pay_method,
                    discount: self.discount.map(Amount::from_float).unwrap_or_default(),
                    key: required(self.key, line, command, "key")?,
                })
            }
            "refund" => Ok(Command::Refund {
                order: required(self.order, line, command, "order")?,
                key: self.key,
            }),
            "cancel" => Ok(Command::Cancel {
                order: required(self.order, line, command, "order")?,
            }),
            "complete" => Ok(Command::Complete {
                order: required(self.order, line, command, "order")?,
            }),
            "freeze" => Ok(Command::Freeze {
                customer: required(self.customer, line, command, "customer")?,
            }),
            "unfreeze" => Ok(Command::Unfreeze {
                customer: required(self.customer, line, command, "customer")?,
            }),
            other => Err(CsvError::UnrecognizedCommand {
                line,
                command: other.to_string(),
            }),
        }
    }
}

/// Read batch commands from a csv file
///
/// The returned iterator owns the open file and borrows nothing, so it can be
/// moved into a spawned task after `path` is gone.
pub fn read_commands(
    path: &Path,
) -> Result<impl Iterator<Item = Result<Command, CsvError>> + Send + use<>, CsvError> {
    let reader = open(path)?;

    Ok(reader
        .into_deserialize::<CommandRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            row.into_command(line)
        }))
}

/// Read the product catalog from a csv file
pub fn read_products(path: impl AsRef<Path>) -> Result<Vec<Product>, CsvError> {
    let reader = open(path.as_ref())?;

    reader
        .into_deserialize::<ProductRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2;
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            Ok(Product {
                id: row.id,
                name: row.name,
                price: Amount::from_float(row.price),
                duration_min: row.duration_min.unwrap_or(0),
                sellable: row.sellable,
            })
        })
        .collect()
}

/// Write wallets in csv format, ordered by customer
pub fn write_wallets(
    out: impl io::Write,
    wallets: impl IntoIterator<Item = Wallet>,
) -> Result<(), CsvError> {
    let mut wallets: Vec<Wallet> = wallets.into_iter().collect();
    wallets.sort_by_key(|w| w.customer_id);

    let mut writer = csv::Writer::from_writer(out);
    for wallet in wallets {
        writer.serialize(WalletRow {
            customer: wallet.customer_id,
            balance: wallet.balance.to_string(),
            frozen: wallet.is_frozen(),
        })?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WalletStatus;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "type,customer,order,amount,product,qty,pay,discount,key\n";

    fn write_csv(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn read_all(content: &str) -> Vec<Result<Command, CsvError>> {
        let file = write_csv(content);
        read_commands(file.path()).unwrap().collect()
    }

    #[test]
    fn read_recharge() {
        let results = read_all(&format!("{HEADER}recharge,1,,10.5,,,,,R1\n"));
        assert_eq!(results.len(), 1);
        assert_eq!(
            results.into_iter().next().unwrap().unwrap(),
            Command::Recharge {
                customer: 1,
                amount: Amount::from_minor(1_050),
                key: "R1".into(),
            }
        );
    }

    #[test]
    fn read_order_with_defaults() {
        let results = read_all(&format!("{HEADER}order,2,,,100,,cash,,K1\n"));
        match results.into_iter().next().unwrap().unwrap() {
            Command::Order {
                customer,
                product,
                qty,
                pay_method,
                discount,
                key,
            } => {
                assert_eq!(customer, 2);
                assert_eq!(product, 100);
                assert_eq!(qty, 1);
                assert_eq!(pay_method, PayMethod::Cash);
                assert_eq!(discount, Amount::ZERO);
                assert_eq!(key, "K1");
            }
            other => panic!("expected order, got {other:?}"),
        }
    }

    #[test]
    fn read_refund_with_optional_key() {
        let results = read_all(&format!("{HEADER}refund,,7,,,,,,\nrefund,,8,,,,,,RF\n"));
        assert_eq!(
            results[0].as_ref().unwrap(),
            &Command::Refund { order: 7, key: None }
        );
        assert_eq!(
            results[1].as_ref().unwrap(),
            &Command::Refund {
                order: 8,
                key: Some("RF".into())
            }
        );
    }

    #[test]
    fn read_with_whitespace() {
        let results = read_all(
            "type, customer, order, amount, product, qty, pay, discount, key\nfreeze, 1, , , , , , ,\n",
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), &Command::Freeze { customer: 1 });
    }

    #[test]
    fn read_returns_error_for_unknown_command() {
        let results = read_all(&format!("{HEADER}transfer,1,,10.0,,,,,X\n"));
        let err = results[0].as_ref().unwrap_err();
        assert!(matches!(err, CsvError::UnrecognizedCommand { line: 2, .. }));
    }

    #[test]
    fn read_returns_error_for_missing_fields() {
        let results = read_all(&format!("{HEADER}recharge,1,,,,,,,R1\norder,1,,,100,1,wallet,,\n"));
        assert!(matches!(
            results[0].as_ref().unwrap_err(),
            CsvError::MissingField { line: 2, field: "amount", .. }
        ));
        assert!(matches!(
            results[1].as_ref().unwrap_err(),
            CsvError::MissingField { line: 3, field: "key", .. }
        ));
    }

    #[test]
    fn read_returns_error_for_bad_pay_method() {
        let results = read_all(&format!("{HEADER}order,1,,,100,1,barter,,K1\n"));
        assert!(matches!(
            results[0].as_ref().unwrap_err(),
            CsvError::InvalidValue { line: 2, .. }
        ));
    }

    #[tokio::test]
    async fn commands_outlive_their_path() {
        let file = write_csv(&format!("{HEADER}recharge,1,,1,,,,,R1\nfreeze,1,,,,,,,\n"));
        let commands = {
            let path = file.path().to_path_buf();
            read_commands(&path).unwrap()
        };
        let read = tokio::spawn(async move { commands.filter(Result::is_ok).count() });
        assert_eq!(read.await.unwrap(), 2);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            read_commands(Path::new("/nonexistent/commands.csv")),
            Err(CsvError::Open { .. })
        ));
    }

    #[test]
    fn read_products_file() {
        let file = write_csv("id,name,price,duration_min,sellable\n1,Haircut,25.00,30,true\n2,Gift card,50,,false\n");
        let products = read_products(file.path()).unwrap();
        assert_eq!(products.len(), 2);
        assert_eq!(products[0].price, Amount::from_minor(2_500));
        assert_eq!(products[1].duration_min, 0);
        assert!(!products[1].sellable);
    }

    #[test]
    fn write_wallets_sorted() {
        let wallet = |customer_id, balance, status| Wallet {
            id: customer_id,
            customer_id,
            balance: Amount::from_minor(balance),
            status,
            updated_at: 0,
        };
        let mut out = Vec::new();
        write_wallets(
            &mut out,
            vec![
                wallet(2, 5_000, WalletStatus::Frozen),
                wallet(1, 1_250, WalletStatus::Active),
            ],
        )
        .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "customer,balance,frozen\n1,12.50,false\n2,50.00,true\n"
        );
    }
}
