//! エポック終了時のコールバック
//!
//! 検証損失を監視して学習率の減衰と早期終了を判断します。
//! 状態はフェーズごとに新しく作ります。

use crate::model::config::{EarlyStoppingSettings, PlateauSettings};

/// 検証損失が停滞したら学習率を下げる
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    settings: PlateauSettings,
    best: f64,
    wait: usize,
    cooldown_counter: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(settings: PlateauSettings) -> Self {
        Self {
            settings,
            best: f64::INFINITY,
            wait: 0,
            cooldown_counter: 0,
        }
    }

    fn in_cooldown(&self) -> bool {
        self.cooldown_counter > 0
    }

    /// エポック終了時に呼び出し、次のエポックの学習率を返す
    pub fn on_epoch_end(&mut self, val_loss: f64, lr: f64) -> f64 {
        if self.in_cooldown() {
            self.cooldown_counter -= 1;
            self.wait = 0;
        }

        if val_loss < self.best - self.settings.min_delta {
            self.best = val_loss;
            self.wait = 0;
            return lr;
        }

        if self.in_cooldown() {
            return lr;
        }

        self.wait += 1;
        if self.wait >= self.settings.patience && lr > self.settings.min_lr {
            let new_lr = (lr * self.settings.factor).max(self.settings.min_lr);
            tracing::info!("検証損失が停滞しています。学習率を {:.3e} -> {:.3e} に下げます", lr, new_lr);
            self.cooldown_counter = self.settings.cooldown;
            self.wait = 0;
            return new_lr;
        }
        lr
    }
}

/// 検証損失が改善しなくなったら学習を打ち切る
///
/// 打ち切ったときは最良エポックのモデルを返せるように保持します。
#[derive(Debug, Clone)]
pub struct EarlyStopping<M> {
    settings: EarlyStoppingSettings,
    best: f64,
    best_epoch: Option<usize>,
    wait: usize,
    best_model: Option<M>,
}

impl<M: Clone> EarlyStopping<M> {
    pub fn new(settings: EarlyStoppingSettings) -> Self {
        Self {
            settings,
            best: f64::INFINITY,
            best_epoch: None,
            wait: 0,
            best_model: None,
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    /// エポック終了時に呼び出し、打ち切る場合は true
    pub fn on_epoch_end(&mut self, epoch: usize, val_loss: f64, model: &M) -> bool {
        if self.settings.restore_best_weights && self.best_model.is_none() {
            self.best_model = Some(model.clone());
        }

        self.wait += 1;
        if val_loss < self.best - self.settings.min_delta {
            self.best = val_loss;
            self.best_epoch = Some(epoch);
            if self.settings.restore_best_weights {
                self.best_model = Some(model.clone());
            }
            self.wait = 0;
            return false;
        }

        self.wait >= self.settings.patience && epoch > 0
    }

    /// 最良エポックのモデルを取り出す
    pub fn take_best_model(&mut self) -> Option<M> {
        if self.settings.restore_best_weights {
            self.best_model.take()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plateau() -> ReduceLrOnPlateau {
        ReduceLrOnPlateau::new(PlateauSettings::default())
    }

    #[test]
    fn test_plateau_halves_after_patience() {
        let mut cb = plateau();
        let mut lr = 1e-3;
        lr = cb.on_epoch_end(1.0, lr);
        assert_eq!(lr, 1e-3);
        lr = cb.on_epoch_end(1.0, lr);
        lr = cb.on_epoch_end(1.0, lr);
        assert_eq!(lr, 1e-3);
        lr = cb.on_epoch_end(1.0, lr);
        assert_eq!(lr, 5e-4);
        // 待機カウンタはリセットされる
        lr = cb.on_epoch_end(1.0, lr);
        assert_eq!(lr, 5e-4);
    }

    #[test]
    fn test_plateau_improvement_resets_wait() {
        let mut cb = plateau();
        let mut lr = 1e-3;
        for loss in [1.0, 1.0, 1.0, 0.5, 0.5, 0.5] {
            lr = cb.on_epoch_end(loss, lr);
        }
        assert_eq!(lr, 1e-3);
    }

    #[test]
    fn test_plateau_min_delta() {
        let mut cb = plateau();
        let mut lr = 1.0;
        // 1e-4 未満の改善は停滞扱い
        for loss in [1.0, 0.99995, 0.99992, 0.99991] {
            lr = cb.on_epoch_end(loss, lr);
        }
        assert_eq!(lr, 0.5);
    }

    #[test]
    fn test_plateau_respects_min_lr() {
        let mut cb = ReduceLrOnPlateau::new(PlateauSettings {
            patience: 1,
            min_lr: 0.4,
            ..PlateauSettings::default()
        });
        let mut lr = 1.0;
        for loss in [1.0, 1.0, 1.0, 1.0] {
            lr = cb.on_epoch_end(loss, lr);
        }
        assert_eq!(lr, 0.4);
    }

    #[test]
    fn test_early_stopping_patience() {
        let mut cb = EarlyStopping::<u32>::new(EarlyStoppingSettings::default());
        assert!(!cb.on_epoch_end(0, 1.0, &0));
        assert!(!cb.on_epoch_end(1, 0.5, &1));
        for epoch in 2..7 {
            assert!(!cb.on_epoch_end(epoch, 0.6, &(epoch as u32)));
        }
        assert!(cb.on_epoch_end(7, 0.6, &7));
        assert_eq!(cb.best_epoch(), Some(1));
        assert_eq!(cb.take_best_model(), Some(1));
    }

    #[test]
    fn test_early_stopping_never_on_first_epoch() {
        let mut cb = EarlyStopping::<u32>::new(EarlyStoppingSettings {
            patience: 0,
            ..EarlyStoppingSettings::default()
        });
        assert!(!cb.on_epoch_end(0, f64::NAN, &0));
        assert!(cb.on_epoch_end(1, f64::NAN, &1));
        // 改善が一度もなければ最初のエポックのモデル
        assert_eq!(cb.take_best_model(), Some(0));
    }

    #[test]
    fn test_early_stopping_without_restore() {
        let mut cb = EarlyStopping::<u32>::new(EarlyStoppingSettings {
            patience: 1,
            restore_best_weights: false,
            ..EarlyStoppingSettings::default()
        });
        cb.on_epoch_end(0, 1.0, &0);
        assert!(cb.on_epoch_end(1, 2.0, &1));
        assert_eq!(cb.take_best_model(), None);
    }
}
